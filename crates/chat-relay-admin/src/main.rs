use chat_relay_core::{ChatId, ItemId, Update, WorkItem, WorkStatus};
use chat_relay_persistence::{Storage, StorageConfig};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cr-admin")]
#[command(about = "Chat Relay Admin CLI", long_about = None)]
struct Args {
    /// Relay data directory
    #[arg(short, long, default_value = "./data", env = "CR_DATA_DIR")]
    data_dir: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Table,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Item counts per status and the resume cursor
    Stats,

    /// List work items
    List {
        /// Filter by status (pending, processing, processed, error)
        #[arg(short, long)]
        status: Option<String>,

        /// Limit number of results
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Show one work item with its decoded update
    Show {
        /// Item ID
        item_id: ItemId,
    },

    /// Print the resume cursor
    Cursor,

    /// Show stored conversation history for a chat
    History {
        /// Chat ID
        #[arg(allow_hyphen_values = true)]
        chat_id: ChatId,
    },
}

/// Work item as shown to operators, with the payload decoded
#[derive(Debug, Serialize)]
struct ItemView {
    id: ItemId,
    source_seq: i64,
    chat_id: ChatId,
    status: WorkStatus,
    claim_epoch: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    text: Option<String>,
}

impl From<&WorkItem> for ItemView {
    fn from(item: &WorkItem) -> Self {
        let text = Update::from_payload(&item.payload)
            .ok()
            .and_then(|update| update.message().and_then(|m| m.text.clone()));

        ItemView {
            id: item.id,
            source_seq: item.source_seq,
            chat_id: item.chat_id,
            status: item.status,
            claim_epoch: item.claim_epoch,
            created_at: item.created_at,
            updated_at: item.updated_at,
            claimed_at: item.claimed_at,
            completed_at: item.completed_at,
            text,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let storage = Storage::open_read_only(StorageConfig {
        data_dir: args.data_dir.clone(),
        ..StorageConfig::default()
    })?;

    match args.command {
        Commands::Stats => {
            let stats = storage.queue.stats()?;

            match args.format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                Format::Yaml => print!("{}", serde_yaml::to_string(&stats)?),
                Format::Table => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["Status", "Count"]);
                    for status in WorkStatus::ALL {
                        table.add_row(vec![status.as_str().to_string(), stats.count(status).to_string()]);
                    }
                    table.add_row(vec!["total".to_string(), stats.total().to_string()]);
                    println!("{table}");
                    println!("Resume cursor: {}", stats.max_source_seq);
                }
            }
        }

        Commands::List { status, limit } => {
            let status = status.map(|s| s.parse::<WorkStatus>()).transpose()?;
            let items = storage.queue.list(status, limit)?;
            let views: Vec<ItemView> = items.iter().map(ItemView::from).collect();

            match args.format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&views)?),
                Format::Yaml => print!("{}", serde_yaml::to_string(&views)?),
                Format::Table => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["ID", "Seq", "Chat", "Status", "Epoch", "Created", "Text"]);
                    for view in &views {
                        table.add_row(vec![
                            view.id.to_string(),
                            view.source_seq.to_string(),
                            view.chat_id.to_string(),
                            view.status.as_str().to_string(),
                            view.claim_epoch.to_string(),
                            view.created_at.to_rfc3339(),
                            preview(view.text.as_deref()),
                        ]);
                    }
                    println!("{table}");
                }
            }
        }

        Commands::Show { item_id } => {
            let Some(item) = storage.queue.get(item_id)? else {
                anyhow::bail!("Work item {} not found", item_id);
            };
            let view = ItemView::from(&item);

            match args.format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&view)?),
                Format::Yaml => print!("{}", serde_yaml::to_string(&view)?),
                Format::Table => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["Field", "Value"]);
                    table.add_row(vec!["ID", &view.id.to_string()]);
                    table.add_row(vec!["Source Seq", &view.source_seq.to_string()]);
                    table.add_row(vec!["Chat", &view.chat_id.to_string()]);
                    table.add_row(vec!["Status", view.status.as_str()]);
                    table.add_row(vec!["Claim Epoch", &view.claim_epoch.to_string()]);
                    table.add_row(vec!["Created", &view.created_at.to_rfc3339()]);
                    table.add_row(vec!["Updated", &view.updated_at.to_rfc3339()]);
                    if let Some(claimed_at) = view.claimed_at {
                        table.add_row(vec!["Claimed", &claimed_at.to_rfc3339()]);
                    }
                    if let Some(completed_at) = view.completed_at {
                        table.add_row(vec!["Completed", &completed_at.to_rfc3339()]);
                    }
                    if let Some(text) = &view.text {
                        table.add_row(vec!["Text", text]);
                    }
                    println!("{table}");
                }
            }
        }

        Commands::Cursor => {
            let cursor = storage.queue.max_source_seq()?;

            match args.format {
                Format::Json => println!("{}", serde_json::json!({ "max_source_seq": cursor })),
                Format::Yaml => println!("max_source_seq: {}", cursor),
                Format::Table => println!("{}", cursor),
            }
        }

        Commands::History { chat_id } => {
            let history = storage.context.get(chat_id)?;

            match args.format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&history)?),
                Format::Yaml => print!("{}", serde_yaml::to_string(&history)?),
                Format::Table => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["#", "Role", "Content"]);
                    for (i, message) in history.messages().iter().enumerate() {
                        let role = serde_json::to_value(message.role)?;
                        table.add_row(vec![
                            (i + 1).to_string(),
                            role.as_str().unwrap_or_default().to_string(),
                            message.content.clone(),
                        ]);
                    }
                    println!("{table}");
                }
            }
        }
    }

    Ok(())
}

/// First line of a message, shortened for table cells
fn preview(text: Option<&str>) -> String {
    const MAX_CHARS: usize = 40;

    let Some(text) = text else {
        return String::new();
    };
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > MAX_CHARS {
        let cut: String = line.chars().take(MAX_CHARS).collect();
        format!("{}…", cut)
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_relay_core::{Chat, Message};
    use tempfile::TempDir;

    #[test]
    fn test_preview_truncates_first_line() {
        assert_eq!(preview(None), "");
        assert_eq!(preview(Some("short\nsecond line")), "short");
        let long = "x".repeat(60);
        assert_eq!(preview(Some(&long)).chars().count(), 41);
    }

    #[test]
    fn test_item_view_decodes_text() {
        let update = Update {
            update_id: 9,
            message: Some(Message {
                message_id: 1,
                text: Some("hello".to_string()),
                chat: Chat { id: 5 },
                from: None,
            }),
            edited_message: None,
        };
        let item = WorkItem::new(1, 9, 5, update.to_payload().unwrap()).unwrap();

        let view = ItemView::from(&item);
        assert_eq!(view.text.as_deref(), Some("hello"));
        assert_eq!(view.status, WorkStatus::Pending);
    }

    #[test]
    fn test_read_only_open_sees_relay_writes() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            ..StorageConfig::default()
        };

        {
            let storage = Storage::open(config.clone()).unwrap();
            storage.queue.enqueue(3, 1, b"{}".to_vec()).unwrap();
        }

        let storage = Storage::open_read_only(config).unwrap();
        assert_eq!(storage.queue.max_source_seq().unwrap(), 3);
        assert_eq!(storage.queue.stats().unwrap().pending, 1);
    }
}
