//! Importers and exporters: how trip tickets enter and leave the provider's systems.

mod csv_export;
mod csv_import;
pub mod helpers;

pub use csv_export::CsvExporter;
pub use csv_import::CsvImporter;

use async_trait::async_trait;

use crate::db::StoreTransaction;
use crate::error::ProcessorError;
use crate::value::Record;

/// One candidate row for the Clearinghouse, with the file it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub source: Option<String>,
    pub data: Record,
}

impl ImportRow {
    pub fn new(data: Record) -> Self {
        Self { source: None, data }
    }

    pub fn from_source(source: impl Into<String>, data: Record) -> Self {
        Self {
            source: Some(source.into()),
            data,
        }
    }
}

/// Produces provider rows to push to the Clearinghouse.
///
/// Errors that only affect some input (an unreadable file) are kept and
/// handed over through [`Importer::take_errors`]; a returned error aborts
/// the cycle.
#[async_trait]
pub trait Importer: Send {
    async fn process(&mut self, tx: &mut StoreTransaction) -> Result<Vec<ImportRow>, ProcessorError>;

    /// Bookkeeping once every row has been pushed or set aside.
    async fn finalize(
        &mut self,
        tx: &mut StoreTransaction,
        imported: &[ImportRow],
        skipped: &[ImportRow],
        unposted: &[ImportRow],
    ) -> Result<(), ProcessorError>;

    fn take_errors(&mut self) -> Vec<String>;

    /// Called once the cycle's transaction has committed.
    fn committed(&mut self) {}

    /// Called when the cycle's transaction was rolled back.
    fn rolled_back(&mut self) {}
}

/// Writes the tagged records fetched from the Clearinghouse to the provider.
pub trait Exporter: Send {
    fn process(&mut self, batch: &[Record]) -> Result<(), ProcessorError>;

    fn take_errors(&mut self) -> Vec<String>;
}
