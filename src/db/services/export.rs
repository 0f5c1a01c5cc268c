//! Rendering of a job's findings as downloadable files.
//!
//! Both renderers are pure functions of the ordered finding rows, so the same
//! findings always produce byte-identical output.

use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

use super::job_service::JobTracker;
use crate::db::entities::finding;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Json => "application/json",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            _ => Err(OrchestratorError::UnsupportedFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportedResults {
    pub format: ExportFormat,
    pub filename: String,
    pub body: String,
}

#[derive(Serialize)]
struct ExportedFinding<'a> {
    id: i32,
    job_id: Uuid,
    created_at: String,
    payload: &'a Value,
}

impl JobTracker {
    pub async fn export_results(
        &self,
        job_id: Uuid,
        owner_id: i32,
        format: &str,
    ) -> Result<ExportedResults> {
        let format = ExportFormat::from_str(format)?;
        let job = self.get_job(job_id, owner_id).await?;
        let findings = self.findings_of(job.id).await?;

        let body = match format {
            ExportFormat::Csv => render_csv(&findings),
            ExportFormat::Json => render_json(&findings)?,
        };
        Ok(ExportedResults {
            format,
            filename: format!("{}-{}.{}", job.name.replace(['/', '"', '\\'], "_"), job.id, format.extension()),
            body,
        })
    }
}

fn timestamp(finding: &finding::Model) -> String {
    finding.created_at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn render_json(findings: &[finding::Model]) -> Result<String> {
    let rows: Vec<ExportedFinding<'_>> = findings
        .iter()
        .map(|f| ExportedFinding {
            id: f.id,
            job_id: f.job_id,
            created_at: timestamp(f),
            payload: &f.payload,
        })
        .collect();
    Ok(serde_json::to_string_pretty(&rows)?)
}

/// One header row, then one row per finding. Payload keys of all findings
/// become columns in sorted order; a finding without a key leaves its cell
/// empty. Non-object payloads land in a `value` column.
pub fn render_csv(findings: &[finding::Model]) -> String {
    let mut columns: BTreeSet<&str> = BTreeSet::new();
    for f in findings {
        match &f.payload {
            Value::Object(map) => columns.extend(map.keys().map(String::as_str)),
            _ => {
                columns.insert("value");
            }
        }
    }

    let mut out = String::new();
    let header: Vec<&str> = ["finding_id", "job_id", "created_at"]
        .into_iter()
        .chain(columns.iter().copied())
        .collect();
    write_row(&mut out, header.iter().map(|h| h.to_string()));

    for f in findings {
        let mut row = vec![f.id.to_string(), f.job_id.to_string(), timestamp(f)];
        for column in &columns {
            let value = match &f.payload {
                Value::Object(map) => map.get(*column),
                other if *column == "value" => Some(other),
                _ => None,
            };
            row.push(value.map(cell).unwrap_or_default());
        }
        write_row(&mut out, row.into_iter());
    }
    out
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn write_row(out: &mut String, fields: impl Iterator<Item = String>) {
    let mut first = true;
    for field in fields {
        if !first {
            out.push(',');
        }
        first = false;
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(&field);
        }
    }
    out.push_str("\r\n");
}
