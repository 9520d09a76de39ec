use clap::Args;

use trip_adapter::config::Config;
use trip_adapter::db::LocalStore;
use trip_adapter::notify;
use trip_adapter::processors::{CsvExporter, CsvImporter, Exporter, Importer};
use trip_adapter::remote::HttpRemoteClient;
use trip_adapter::sync::SyncCycle;

#[derive(Args, Default)]
pub struct PollCommand {
    /// Skip the import phase even if it is enabled in the config
    #[arg(long)]
    pub no_import: bool,

    /// Skip the export phase even if it is enabled in the config
    #[arg(long)]
    pub no_export: bool,
}

impl PollCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let store = LocalStore::open(&config.database_path).await?;
        let remote = HttpRemoteClient::from_config(&config.api)?;
        let notifier = notify::from_config(&config.notification);

        let mut importer = if config.import.enabled && !self.no_import {
            Some(CsvImporter::from_config(&config.import)?)
        } else {
            None
        };
        let mut exporter = if config.export.enabled && !self.no_export {
            Some(CsvExporter::from_config(&config.export)?)
        } else {
            None
        };

        let mut cycle = SyncCycle::new(&store, &remote, notifier.as_ref());
        if let Some(importer) = importer.as_mut() {
            cycle = cycle.with_importer(importer as &mut dyn Importer);
        }
        if let Some(exporter) = exporter.as_mut() {
            cycle = cycle.with_exporter(exporter as &mut dyn Exporter);
        }

        let report = cycle.poll().await?;

        println!("Fetched {} trips ({} exported)", report.fetched, report.exported);
        println!(
            "Imported {} rows, skipped {}, unposted {}",
            report.imported, report.skipped, report.unposted
        );
        if !report.errors.is_empty() {
            println!("{} errors:", report.errors.len());
            for error in &report.errors {
                println!("  {}", error);
            }
        }
        Ok(())
    }
}
