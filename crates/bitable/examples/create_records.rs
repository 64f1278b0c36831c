//! Create records in a Bitable table by field name, optionally with an
//! attachment.
//!
//! Run with:
//!
//! ```text
//! FEISHU_APP_ID=cli_xxx FEISHU_APP_SECRET=... \
//! FEISHU_APP_TOKEN=bascnXXXX FEISHU_TABLE_ID=tblXXXX \
//! cargo run -p feishu-bitable --example create_records -- [attachment-path]
//! ```
//!
//! The table is expected to have `Name` and `Email` text fields, and an
//! `Attachments` field when a path is given.

use std::collections::BTreeMap;
use std::path::PathBuf;

use feishu_bitable::{Bitable, BitableClient, BitableConfig, FieldKeys, Structured};
use serde::Serialize;
use serde_json::json;

#[derive(Serialize)]
struct Contact {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Email")]
    email: Option<String>,
}

fn env(name: &str) -> Result<String, Box<dyn std::error::Error>> {
    std::env::var(name).map_err(|_| format!("{name} is not set").into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = BitableConfig::new(env("FEISHU_APP_ID")?, env("FEISHU_APP_SECRET")?);
    let client = BitableClient::with_config(config)?;
    let table = Bitable::with_client(client, env("FEISHU_APP_TOKEN")?, env("FEISHU_TABLE_ID")?);

    let schema = table.table_schema().await?;
    println!("Table has {} fields:", schema.len());
    for field in schema.fields() {
        println!("  {} ({}) {:?}", field.field_name, field.field_id, field.field_type);
    }

    let record_id = table
        .create_record(&json!({"Name": "Alice", "Email": "alice@example.com"}), FieldKeys::Names)
        .await?;
    println!("Created {record_id}");

    let contacts = [
        Contact {
            name: "Bob".into(),
            email: Some("bob@example.com".into()),
        },
        Contact {
            name: "Carol".into(),
            email: None,
        },
    ];
    let records: Vec<_> = contacts.iter().map(Structured).collect();
    let ids = table.create_records(&records, FieldKeys::Names).await?;
    println!("Created {} records in one batch: {ids:?}", ids.len());

    if let Some(path) = std::env::args().nth(1).map(PathBuf::from) {
        let attachments = BTreeMap::from([("Attachments".to_owned(), vec![path])]);
        match table
            .upload_and_create_record(&json!({"Name": "With file"}), &attachments, FieldKeys::Names)
            .await
        {
            Ok(record_id) => println!("Created {record_id} with attachment"),
            Err(e) if e.is_unknown_field() => println!("Skipped attachment: {e}"),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
