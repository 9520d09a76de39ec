use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::helpers::{flatten_record, timestamp_string};
use super::Exporter;
use crate::config::ExportConfig;
use crate::error::ProcessorError;
use crate::mapping::{map, MappingRuleset};
use crate::models::CollectionKind;
use crate::normalize::{normalize, NormalizationRuleset};
use crate::value::{display, Record};

/// Tag keys that do not make a trip entry worth exporting on their own.
const BOOKKEEPING_KEYS: [&str; 2] = ["id", "new_record"];

/// Writes one CSV file per collection kind into the export folder.
pub struct CsvExporter {
    export_folder: PathBuf,
    mapping: Option<MappingRuleset>,
    normalization: Option<NormalizationRuleset>,
    errors: Vec<String>,
}

/// Rows of one collection kind, ready to write.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportTable {
    pub kind: CollectionKind,
    pub headers: Vec<String>,
    pub rows: Vec<Record>,
}

impl CsvExporter {
    pub fn new(export_folder: impl Into<PathBuf>) -> Self {
        Self {
            export_folder: export_folder.into(),
            mapping: None,
            normalization: None,
            errors: Vec::new(),
        }
    }

    pub fn from_config(config: &ExportConfig) -> Result<Self, ProcessorError> {
        let folder = config.export_folder.clone().ok_or_else(|| {
            ProcessorError::NotConfigured(
                "Export folder not configured, will not export new changes detected on the Clearinghouse"
                    .to_string(),
            )
        })?;

        let mut exporter = Self::new(folder);
        if let Some(path) = &config.mapping_file {
            exporter.mapping = Some(MappingRuleset::load(path)?);
        }
        if let Some(path) = &config.normalization_file {
            exporter.normalization = Some(NormalizationRuleset::load(path)?);
        }
        Ok(exporter)
    }

    pub fn with_mapping(mut self, mapping: MappingRuleset) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn with_normalization(mut self, normalization: NormalizationRuleset) -> Self {
        self.normalization = Some(normalization);
        self
    }

    /// Flattens and transforms the batch into one table per kind.
    ///
    /// Kinds with no rows are left out.
    pub fn tables(&self, batch: &[Record]) -> Result<Vec<ExportTable>, ProcessorError> {
        let mut tables = Vec::new();
        for (kind, records) in split_batch(batch) {
            if records.is_empty() {
                continue;
            }
            let sub = kind.ruleset_name();
            let except = self
                .mapping
                .as_ref()
                .map(|m| m.keys(Some(sub)))
                .unwrap_or_default();

            let mut headers: Vec<String> = Vec::new();
            let mut rows = Vec::with_capacity(records.len());
            for record in &records {
                let mut row = flatten_record(record, &except, None);
                if let Some(mapping) = &self.mapping {
                    row = map(&row, mapping, Some(sub), Record::new())?;
                }
                if let Some(normalization) = &self.normalization {
                    row = normalize(&row, normalization, Some(sub), Record::new())?;
                }
                for key in row.keys() {
                    if !headers.contains(key) {
                        headers.push(key.clone());
                    }
                }
                rows.push(row);
            }
            tables.push(ExportTable { kind, headers, rows });
        }
        Ok(tables)
    }

    /// Writes the batch, naming files with the `now` timestamp.
    pub fn export(&mut self, batch: &[Record], now: DateTime<Utc>) -> Result<Vec<PathBuf>, ProcessorError> {
        if !self.export_folder.is_dir() {
            return Err(ProcessorError::MissingFolder(self.export_folder.clone()));
        }

        let timestamp = timestamp_string(now);
        let mut written = Vec::new();
        for table in self.tables(batch)? {
            let path = self
                .export_folder
                .join(format!("{}.{}.csv", table.kind.file_stem(), timestamp));
            match write_table(&path, &table) {
                Ok(()) => {
                    tracing::info!(file = %path.display(), rows = table.rows.len(), "Exported changes");
                    written.push(path);
                }
                Err(e) => {
                    tracing::error!(file = %path.display(), error = %e, "Failed to write export file");
                    self.errors.push(format!("Failed to export {}: {}", table.kind.file_stem(), e));
                }
            }
        }
        Ok(written)
    }
}

/// Splits tagged trip tickets into trips, claims, comments and results.
pub fn split_batch(batch: &[Record]) -> Vec<(CollectionKind, Vec<Record>)> {
    let mut groups: Vec<(CollectionKind, Vec<Record>)> =
        CollectionKind::ALL.into_iter().map(|kind| (kind, Vec::new())).collect();

    for trip in batch {
        let mut trip = trip.clone();
        for (index, kind) in CollectionKind::ALL.into_iter().enumerate() {
            let Some(key) = kind.record_key() else { continue };
            match trip.remove(key) {
                Some(Value::Array(items)) => groups[index].1.extend(items.into_iter().filter_map(|item| match item {
                    Value::Object(record) if !record.is_empty() => Some(record),
                    _ => None,
                })),
                Some(Value::Object(record)) if has_content(&record) => groups[index].1.push(record),
                _ => {}
            }
        }
        if has_content(&trip) {
            groups[0].1.push(trip);
        }
    }
    groups
}

fn has_content(record: &Record) -> bool {
    record.keys().any(|k| !BOOKKEEPING_KEYS.contains(&k.as_str()))
}

fn write_table(path: &Path, table: &ExportTable) -> Result<(), ProcessorError> {
    let csv_error = |source| ProcessorError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    writer.write_record(&table.headers).map_err(csv_error)?;
    for row in &table.rows {
        let fields: Vec<String> = table
            .headers
            .iter()
            .map(|h| row.get(h).map(display).unwrap_or_default())
            .collect();
        writer.write_record(&fields).map_err(csv_error)?;
    }
    writer.flush().map_err(|source| ProcessorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

impl Exporter for CsvExporter {
    fn process(&mut self, batch: &[Record]) -> Result<(), ProcessorError> {
        tracing::info!(folder = %self.export_folder.display(), trips = batch.len(), "Starting export");
        self.export(batch, Utc::now())?;
        Ok(())
    }

    fn take_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.errors)
    }
}
