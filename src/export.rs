//! Streaming export of search results
//!
//! Pages read by [`Gateway::export`](crate::Gateway::export) are written as
//! they arrive, in submission order, so memory stays bounded by the page
//! window rather than the result size.

use crate::batch::{BatchJob, ChunkPayload, ChunkSink};
use crate::error::{GatewayError, Result};
use crate::gateway::BatchRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::Write;
use std::str::FromStr;

pub const DEFAULT_EXPORT_PAGE_SIZE: usize = 500;

/// Output file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("unknown export format '{}'", other)),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Csv => write!(f, "csv"),
            ExportFormat::Json => write!(f, "json"),
        }
    }
}

/// Export parameters
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub format: ExportFormat,
    pub page_size: usize,
    /// Stop after this many records
    pub max_records: Option<usize>,
    pub batch: BatchRequest,
}

impl Default for ExportRequest {
    fn default() -> Self {
        Self {
            format: ExportFormat::default(),
            page_size: DEFAULT_EXPORT_PAGE_SIZE,
            max_records: None,
            batch: BatchRequest::default(),
        }
    }
}

impl ExportRequest {
    pub fn format(mut self, format: ExportFormat) -> Self {
        self.format = format;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn max_records(mut self, max_records: usize) -> Self {
        self.max_records = Some(max_records);
        self
    }

    pub fn batch(mut self, batch: BatchRequest) -> Self {
        self.batch = batch;
        self
    }
}

/// Result of an export
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub model: String,
    pub format: ExportFormat,
    /// Records selected for export (count capped by `max_records`)
    pub total: usize,
    /// Records actually written
    pub exported: usize,
    pub job: BatchJob,
}

enum Output<W: Write> {
    Csv {
        writer: csv::Writer<W>,
        fields: Vec<String>,
    },
    Json {
        out: W,
        first: bool,
    },
}

/// Writes search_read pages to CSV or a JSON array
pub struct ExportWriter<W: Write> {
    output: Output<W>,
    written: usize,
}

impl<W: Write> ExportWriter<W> {
    /// CSV writer with one column per field, headed by `headers`
    pub fn csv(out: W, fields: Vec<String>, headers: &[String]) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new().from_writer(out);
        writer.write_record(headers)?;
        Ok(Self {
            output: Output::Csv { writer, fields },
            written: 0,
        })
    }

    /// JSON writer producing one array of record objects
    pub fn json(mut out: W) -> Result<Self> {
        out.write_all(b"[")?;
        Ok(Self {
            output: Output::Json { out, first: true },
            written: 0,
        })
    }

    pub fn write_records(&mut self, records: &[Value]) -> Result<()> {
        for record in records {
            match &mut self.output {
                Output::Csv { writer, fields } => {
                    let row: Vec<String> = fields
                        .iter()
                        .map(|field| csv_cell(record.get(field).unwrap_or(&Value::Null)))
                        .collect();
                    writer.write_record(&row)?;
                }
                Output::Json { out, first } => {
                    let separator: &[u8] = if *first { b"\n  " } else { b",\n  " };
                    out.write_all(separator)?;
                    serde_json::to_writer(&mut *out, record)
                        .map_err(|e| GatewayError::Io(format!("JSON write error: {}", e)))?;
                    *first = false;
                }
            }
            self.written += 1;
        }
        Ok(())
    }

    /// Close the document and flush; returns the number of records written
    pub fn finish(self) -> Result<usize> {
        match self.output {
            Output::Csv { mut writer, .. } => writer.flush()?,
            Output::Json { mut out, first } => {
                let close: &[u8] = if first { b"]\n" } else { b"\n]\n" };
                out.write_all(close)?;
                out.flush()?;
            }
        }
        Ok(self.written)
    }
}

#[async_trait]
impl<W: Write + Send> ChunkSink for ExportWriter<W> {
    async fn accept(&mut self, chunk: ChunkPayload) -> Result<()> {
        match chunk.payload {
            Value::Array(records) => self.write_records(&records),
            other => Err(GatewayError::Internal(format!(
                "page {} is not a record list: {}",
                chunk.index, other
            ))),
        }
    }
}

/// Flatten one field value into a CSV cell
///
/// Relations `[id, name]` become their name, lists are comma-joined, unset
/// values (`false`, `null`) are empty and objects are written as JSON.
pub fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null | Value::Bool(false) => String::new(),
        Value::Bool(true) => "true".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => match relation_name(value) {
            Some(name) => name.to_string(),
            None => items
                .iter()
                .map(|item| {
                    relation_name(item)
                        .map(str::to_string)
                        .unwrap_or_else(|| csv_cell(item))
                })
                .collect::<Vec<_>>()
                .join(","),
        },
        Value::Object(_) => value.to_string(),
    }
}

/// Display name of a `[id, name]` relation pair
fn relation_name(value: &Value) -> Option<&str> {
    match value.as_array().map(Vec::as_slice) {
        Some([Value::Number(_), Value::String(name)]) => Some(name.as_str()),
        _ => None,
    }
}
