use clap::{Args, ValueEnum};

use trip_adapter::config::Config;
use trip_adapter::db::LocalStore;
use trip_adapter::value::format_timestamp;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct StatusCommand {
    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl StatusCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let store = LocalStore::open(&config.database_path).await?;
        let tracked = store.tracked_count().await?;
        let last_update = store.max_remote_updated_at().await?;
        let imported_files = store.imported_file_count().await?;

        match self.format {
            OutputFormat::Json => {
                let status = serde_json::json!({
                    "database_path": config.database_path.display().to_string(),
                    "tracked_tickets": tracked,
                    "last_remote_update": last_update.as_ref().map(format_timestamp),
                    "imported_files": imported_files,
                });
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            OutputFormat::Text => {
                println!("Adapter status");
                println!("==============\n");
                println!("database_path: {}", config.database_path.display());
                println!("tracked tickets: {}", tracked);
                match last_update {
                    Some(ts) => println!("last Clearinghouse update: {}", format_timestamp(&ts)),
                    None => println!("last Clearinghouse update: never"),
                }
                println!("imported files: {}", imported_files);
            }
        }
        Ok(())
    }
}
