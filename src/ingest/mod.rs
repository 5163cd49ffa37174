//! Tabular ingestion (SPEC_FULL 4.1, component C1).
//!
//! Detects a source file's format/encoding/delimiter, streams rows in
//! configurable chunks, and maps free-form headers onto the canonical
//! `name`/`company`/`email`/`phone` fields.

pub mod format;
pub mod mapping;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use self::format::{detect_and_decode, Delimiter, FileFormat};
use self::mapping::{ColumnMapper, MappingResult};

/// Errors raised while inspecting or streaming a source file.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV parse error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("spreadsheet parse error in {path}: {message}")]
    Excel { path: PathBuf, message: String },
    #[error("JSON parse error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("source file {0} contains no rows")]
    Empty(PathBuf),
    #[error("unsupported sheet name {0} in {1}")]
    SheetNotFound(String, PathBuf),
}

/// Detected shape of a source file plus a small non-destructive sample.
#[derive(Debug, Clone)]
pub struct FileStructure {
    pub format: FileFormat,
    pub delimiter: Option<Delimiter>,
    pub encoding_confident: bool,
    pub headers: Vec<String>,
    pub sample_rows: Vec<HashMap<String, String>>,
    pub estimated_row_count: Option<u64>,
}

/// One source row, tagged with its 1-based position in the file.
#[derive(Debug, Clone)]
pub struct RowRecord {
    pub row_number: u64,
    pub fields: HashMap<String, String>,
}

const SAMPLE_ROW_COUNT: usize = 5;
const PROBE_BYTES: usize = 1024;
const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Reads and maps a tabular source file.
pub struct Ingestor {
    mapper: ColumnMapper,
    chunk_size: usize,
}

impl Ingestor {
    pub fn new(mapper: ColumnMapper) -> Self {
        Self {
            mapper,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Inspect `path`: detect format/encoding/delimiter, read headers and a
    /// sample, and return a `FieldBinding` via column mapping.
    pub fn inspect(&self, path: &Path) -> Result<(FileStructure, MappingResult), IngestError> {
        let bytes = fs::read(path).map_err(|e| IngestError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let format = FileFormat::detect(path, &bytes[..bytes.len().min(PROBE_BYTES)]);
        let rows = self.read_all_rows(path, &bytes, format)?;
        if rows.is_empty() {
            return Err(IngestError::Empty(path.to_path_buf()));
        }

        let headers: Vec<String> = rows[0].fields.keys().cloned().collect();
        let sample_rows: Vec<HashMap<String, String>> =
            rows.iter().take(SAMPLE_ROW_COUNT).map(|r| r.fields.clone()).collect();

        let (_, encoding_confident) = match format {
            FileFormat::Csv | FileFormat::Tsv | FileFormat::Text | FileFormat::Json | FileFormat::JsonLines => {
                detect_and_decode(&bytes)
            }
            FileFormat::Xlsx | FileFormat::Xls => (String::new(), true),
        };

        let delimiter = match format {
            FileFormat::Csv | FileFormat::Tsv | FileFormat::Text => {
                Some(Delimiter::detect(&bytes[..bytes.len().min(PROBE_BYTES)]))
            }
            _ => None,
        };

        let structure = FileStructure {
            format,
            delimiter,
            encoding_confident,
            headers: headers.clone(),
            sample_rows: sample_rows.clone(),
            estimated_row_count: Some(rows.len() as u64),
        };

        let mapping = self.mapper.map_columns(&headers, &sample_rows);
        Ok((structure, mapping))
    }

    /// Stream rows from `path` in chunks of `self.chunk_size`. Not
    /// restartable; callers re-open the source to restart (SPEC_FULL 4.1).
    pub fn stream_chunks(&self, path: &Path) -> Result<Vec<Vec<RowRecord>>, IngestError> {
        let bytes = fs::read(path).map_err(|e| IngestError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let format = FileFormat::detect(path, &bytes[..bytes.len().min(PROBE_BYTES)]);
        let rows = self.read_all_rows(path, &bytes, format)?;
        Ok(rows
            .chunks(self.chunk_size)
            .map(|chunk| chunk.to_vec())
            .collect())
    }

    fn read_all_rows(
        &self,
        path: &Path,
        bytes: &[u8],
        format: FileFormat,
    ) -> Result<Vec<RowRecord>, IngestError> {
        match format {
            FileFormat::Csv | FileFormat::Tsv | FileFormat::Text => {
                let delimiter = Delimiter::detect(&bytes[..bytes.len().min(PROBE_BYTES)]);
                self.read_delimited(path, bytes, delimiter.as_byte())
            }
            FileFormat::Json => self.read_json(path, bytes),
            FileFormat::JsonLines => self.read_jsonl(path, bytes),
            FileFormat::Xlsx | FileFormat::Xls => self.read_spreadsheet(path),
        }
    }

    fn read_delimited(
        &self,
        path: &Path,
        bytes: &[u8],
        delimiter: u8,
    ) -> Result<Vec<RowRecord>, IngestError> {
        let (text, _) = detect_and_decode(bytes);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| IngestError::Csv {
                path: path.to_path_buf(),
                source: e,
            })?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let mut rows = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record.map_err(|e| IngestError::Csv {
                path: path.to_path_buf(),
                source: e,
            })?;
            let mut fields = HashMap::with_capacity(headers.len());
            for (i, header) in headers.iter().enumerate() {
                fields.insert(header.clone(), record.get(i).unwrap_or("").to_string());
            }
            rows.push(RowRecord {
                row_number: (idx + 1) as u64,
                fields,
            });
        }
        Ok(rows)
    }

    fn read_json(&self, path: &Path, bytes: &[u8]) -> Result<Vec<RowRecord>, IngestError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| IngestError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        let array = value.as_array().cloned().unwrap_or_default();
        Ok(array
            .into_iter()
            .enumerate()
            .map(|(idx, item)| RowRecord {
                row_number: (idx + 1) as u64,
                fields: flatten_object(&item),
            })
            .collect())
    }

    fn read_jsonl(&self, path: &Path, bytes: &[u8]) -> Result<Vec<RowRecord>, IngestError> {
        let (text, _) = detect_and_decode(bytes);
        let mut rows = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(trimmed).map_err(|e| IngestError::Json {
                path: path.to_path_buf(),
                source: e,
            })?;
            rows.push(RowRecord {
                row_number: (idx + 1) as u64,
                fields: flatten_object(&value),
            });
        }
        Ok(rows)
    }

    fn read_spreadsheet(&self, path: &Path) -> Result<Vec<RowRecord>, IngestError> {
        use calamine::Reader;
        let mut workbook = calamine::open_workbook_auto(path).map_err(|e| IngestError::Excel {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let sheet_name = workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| IngestError::Empty(path.to_path_buf()))?;
        let range = workbook
            .worksheet_range(&sheet_name)
            .map_err(|_| IngestError::SheetNotFound(sheet_name.clone(), path.to_path_buf()))?;

        let mut rows_iter = range.rows();
        let header_row = rows_iter.next().ok_or_else(|| IngestError::Empty(path.to_path_buf()))?;
        let headers: Vec<String> = header_row.iter().map(|c| c.to_string()).collect();

        let mut rows = Vec::new();
        for (idx, row) in rows_iter.enumerate() {
            let mut fields = HashMap::with_capacity(headers.len());
            for (i, header) in headers.iter().enumerate() {
                let value = row.get(i).map(|c| c.to_string()).unwrap_or_default();
                fields.insert(header.clone(), value);
            }
            rows.push(RowRecord {
                row_number: (idx + 1) as u64,
                fields,
            });
        }
        Ok(rows)
    }
}

fn flatten_object(value: &Value) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(obj) = value.as_object() {
        for (k, v) in obj {
            let s = match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            out.insert(k.clone(), s);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str, ext: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(ext).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn inspects_a_simple_csv() {
        let file = write_temp("name,email,phone\nJane,jane@example.com,+15551234567\n", ".csv");
        let ingestor = Ingestor::new(ColumnMapper::new());
        let (structure, mapping) = ingestor.inspect(file.path()).unwrap();
        assert_eq!(structure.format, FileFormat::Csv);
        assert_eq!(structure.estimated_row_count, Some(1));
        assert!(mapping.missing_required_fields.contains(&"company".to_string()));
        assert_eq!(mapping.mappings.get("email").unwrap().source_column, "email");
    }

    #[test]
    fn streams_rows_in_chunks() {
        let mut contents = String::from("name,email\n");
        for i in 0..5 {
            contents.push_str(&format!("Person{i},person{i}@example.com\n"));
        }
        let file = write_temp(&contents, ".csv");
        let ingestor = Ingestor::new(ColumnMapper::new()).with_chunk_size(2);
        let chunks = ingestor.stream_chunks(file.path()).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[2].len(), 1);
        assert_eq!(chunks[0][0].row_number, 1);
    }

    #[test]
    fn empty_file_is_rejected() {
        let file = write_temp("", ".csv");
        let ingestor = Ingestor::new(ColumnMapper::new());
        assert!(matches!(
            ingestor.inspect(file.path()),
            Err(IngestError::Empty(_))
        ));
    }

    #[test]
    fn reads_json_array_of_objects() {
        let file = write_temp(
            r#"[{"name":"Jane","email":"jane@example.com"},{"name":"Bob","email":"bob@example.com"}]"#,
            ".json",
        );
        let ingestor = Ingestor::new(ColumnMapper::new());
        let (structure, _) = ingestor.inspect(file.path()).unwrap();
        assert_eq!(structure.format, FileFormat::Json);
        assert_eq!(structure.estimated_row_count, Some(2));
    }

    #[test]
    fn reads_jsonl_one_object_per_line() {
        let file = write_temp(
            "{\"name\":\"Jane\"}\n{\"name\":\"Bob\"}\n",
            ".jsonl",
        );
        let ingestor = Ingestor::new(ColumnMapper::new());
        let (structure, _) = ingestor.inspect(file.path()).unwrap();
        assert_eq!(structure.format, FileFormat::JsonLines);
        assert_eq!(structure.estimated_row_count, Some(2));
    }
}
