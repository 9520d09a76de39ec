use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::helpers::preprocess_row;
use super::{ImportRow, Importer};
use crate::config::ImportConfig;
use crate::db::StoreTransaction;
use crate::error::ProcessorError;
use crate::mapping::{map, MappingRuleset};
use crate::models::ImportedFileRecord;
use crate::normalize::{normalize, NormalizationRuleset};
use crate::value::{canonical_key, Record};

const IMPORTABLE_EXTENSIONS: [&str; 2] = ["csv", "txt"];

/// A file parsed during the current cycle.
#[derive(Debug, Clone)]
struct ParsedFile {
    path: PathBuf,
    record: ImportedFileRecord,
}

/// Imports trip rows from the CSV files dropped in a folder.
pub struct CsvImporter {
    import_folder: PathBuf,
    completed_folder: Option<PathBuf>,
    mapping: Option<MappingRuleset>,
    normalization: Option<NormalizationRuleset>,
    parsed: Vec<ParsedFile>,
    /// Files recorded as imported, moved once the cycle commits.
    finalized: Vec<PathBuf>,
    errors: Vec<String>,
}

impl CsvImporter {
    pub fn new(import_folder: impl Into<PathBuf>) -> Self {
        Self {
            import_folder: import_folder.into(),
            completed_folder: None,
            mapping: None,
            normalization: None,
            parsed: Vec::new(),
            finalized: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn from_config(config: &ImportConfig) -> Result<Self, ProcessorError> {
        let folder = config.import_folder.clone().ok_or_else(|| {
            ProcessorError::NotConfigured(
                "Import folder not configured, will not check for files to import".to_string(),
            )
        })?;

        let mut importer = Self::new(folder);
        importer.completed_folder = config.completed_folder.clone();
        if let Some(path) = &config.mapping_file {
            importer.mapping = Some(MappingRuleset::load(path)?);
        }
        if let Some(path) = &config.normalization_file {
            importer.normalization = Some(NormalizationRuleset::load(path)?);
        }
        Ok(importer)
    }

    pub fn with_completed_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.completed_folder = Some(folder.into());
        self
    }

    pub fn with_mapping(mut self, mapping: MappingRuleset) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn with_normalization(mut self, normalization: NormalizationRuleset) -> Self {
        self.normalization = Some(normalization);
        self
    }

    /// The `.csv` and `.txt` files in the import folder, sorted by name.
    pub fn importable_files(&self) -> Result<Vec<PathBuf>, ProcessorError> {
        if !self.import_folder.is_dir() {
            return Err(ProcessorError::MissingFolder(self.import_folder.clone()));
        }

        let entries = fs::read_dir(&self.import_folder).map_err(|source| ProcessorError::Io {
            path: self.import_folder.clone(),
            source,
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMPORTABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Reads every row of a CSV file, keyed by its canonical headers.
    pub fn read_file(path: &Path) -> Result<Vec<Record>, ProcessorError> {
        let csv_error = |source| ProcessorError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::Headers)
            .from_path(path)
            .map_err(csv_error)?;
        let headers: Vec<String> = reader.headers().map_err(csv_error)?.iter().map(canonical_key).collect();

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result.map_err(csv_error)?;
            let row: Record = headers
                .iter()
                .zip(record.iter())
                .map(|(header, field)| {
                    let value = if field.is_empty() {
                        Value::Null
                    } else {
                        Value::String(field.to_string())
                    };
                    (header.clone(), value)
                })
                .collect();
            rows.push(row);
        }
        Ok(rows)
    }

    fn transform(&self, mut row: Record) -> Result<Record, ProcessorError> {
        preprocess_row(&mut row);
        if let Some(mapping) = &self.mapping {
            row = map(&row, mapping, None, Record::new())?;
        }
        if let Some(normalization) = &self.normalization {
            row = normalize(&row, normalization, None, Record::new())?;
        }
        Ok(row)
    }

    fn mark_file_error(&self, path: &Path) {
        let mut renamed = path.as_os_str().to_owned();
        renamed.push(".error");
        if let Err(e) = fs::rename(path, &renamed) {
            tracing::error!(
                file = %path.display(),
                error = %e,
                "Error marking file as imported with errors, make sure the adapter has read-write access"
            );
        }
    }

    fn move_to_completed(&self, path: &Path) {
        let Some(folder) = &self.completed_folder else {
            return;
        };
        let Some(name) = path.file_name() else {
            return;
        };
        if let Err(e) = fs::rename(path, folder.join(name)) {
            tracing::error!(
                file = %path.display(),
                folder = %folder.display(),
                error = %e,
                "Error moving imported file, make sure the adapter has read-write access"
            );
        }
    }
}

fn file_identity(path: &Path) -> Result<(i64, DateTime<Utc>), ProcessorError> {
    let metadata = fs::metadata(path).map_err(|source| ProcessorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let modified = metadata.modified().map_err(|source| ProcessorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let modified = DateTime::<Utc>::from(modified);
    let modified = DateTime::from_timestamp_micros(modified.timestamp_micros()).unwrap_or(modified);
    Ok((i64::try_from(metadata.len()).unwrap_or(i64::MAX), modified))
}

#[async_trait]
impl Importer for CsvImporter {
    async fn process(&mut self, tx: &mut StoreTransaction) -> Result<Vec<ImportRow>, ProcessorError> {
        tracing::info!(folder = %self.import_folder.display(), "Starting import");
        self.parsed.clear();
        self.finalized.clear();

        let files = self.importable_files()?;
        tracing::info!(count = files.len(), "Found files to import");

        let mut rows = Vec::new();
        for path in files {
            let file_name = path.display().to_string();
            let (size, modified) = file_identity(&path)?;

            if tx.is_file_imported(&file_name, size, modified).await? {
                tracing::warn!(file = %file_name, "Skipping file which was previously imported");
                continue;
            }

            match Self::read_file(&path) {
                Ok(file_rows) => {
                    tracing::info!(file = %file_name, rows = file_rows.len(), "Read import file");
                    let count = file_rows.len() as i64;
                    for row in file_rows {
                        rows.push(ImportRow::from_source(file_name.clone(), self.transform(row)?));
                    }
                    self.parsed.push(ParsedFile {
                        path,
                        record: ImportedFileRecord::new(file_name, size, modified).with_rows(count, 0),
                    });
                }
                Err(e) => {
                    tracing::error!(file = %file_name, error = %e, "Failed to read import file");
                    self.errors.push(format!(
                        "An error was encountered while importing rows from file {}:\n\t{}\nThe file has been renamed and none of its rows were imported.",
                        file_name, e
                    ));
                    self.mark_file_error(&path);
                }
            }
        }

        Ok(rows)
    }

    async fn finalize(
        &mut self,
        tx: &mut StoreTransaction,
        _imported: &[ImportRow],
        skipped: &[ImportRow],
        unposted: &[ImportRow],
    ) -> Result<(), ProcessorError> {
        for parsed in std::mem::take(&mut self.parsed) {
            let mut record = parsed.record;
            let failed = skipped
                .iter()
                .chain(unposted)
                .filter(|row| row.source.as_deref() == Some(record.file_name.as_str()))
                .count() as i64;
            record.row_errors = failed;

            tx.record_imported_file(&record).await?;
            self.finalized.push(parsed.path);

            if failed > 0 {
                self.errors.push(format!(
                    "Encountered {} errors while importing file {}",
                    failed, record.file_name
                ));
            }
        }
        Ok(())
    }

    fn take_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.errors)
    }

    fn committed(&mut self) {
        for path in std::mem::take(&mut self.finalized) {
            self.move_to_completed(&path);
        }
    }

    fn rolled_back(&mut self) {
        self.finalized.clear();
    }
}
