//! Pipe-delimited service tables served by the patch service.
//!
//! The first line is a header of `Name!TYPE:hint` tokens; every later
//! line is a record. Lines starting with `##` (sequence numbers and the
//! like) and blank lines carry no records.

use crate::{Error, Result};

/// A parsed pipe-delimited table.
#[derive(Debug, Clone)]
pub struct PipeTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl PipeTable {
    /// Parse a service table.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty() && !l.starts_with("##"));

        let Some((header_line, header)) = lines.next() else {
            return Err(Error::InvalidManifest {
                line: 0,
                reason: "empty table".to_string(),
            });
        };

        let columns: Vec<String> = header
            .split('|')
            .map(|token| {
                // `Region!STRING:0` names the column before the type hint.
                token.split('!').next().unwrap_or(token).trim().to_string()
            })
            .collect();
        if columns.iter().any(String::is_empty) {
            return Err(Error::InvalidManifest {
                line: header_line + 1,
                reason: "empty column name in header".to_string(),
            });
        }

        let mut rows = Vec::new();
        for (line_no, line) in lines {
            let fields: Vec<String> = line.split('|').map(|f| f.trim().to_string()).collect();
            if fields.len() != columns.len() {
                return Err(Error::InvalidManifest {
                    line: line_no + 1,
                    reason: format!(
                        "{} fields, header has {} columns",
                        fields.len(),
                        columns.len()
                    ),
                });
            }
            rows.push(fields);
        }

        Ok(Self { columns, rows })
    }

    /// Index of the named column, or the positional fallback.
    fn column(&self, name: &str, fallback: usize) -> usize {
        self.columns
            .iter()
            .position(|c| c == name)
            .unwrap_or(fallback)
    }

    /// All rows.
    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }
}

/// One row of the versions table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    /// Region code.
    pub region: String,
    /// Build configuration hash.
    pub build_config: String,
    /// CDN configuration hash.
    pub cdn_config: String,
    /// Build number, when present.
    pub build_id: Option<u32>,
    /// Human-readable version name, when present.
    pub versions_name: Option<String>,
}

/// One row of the cdns table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnEntry {
    /// Region the mirrors serve.
    pub name: String,
    /// CDN path stem, e.g. `tpr/wow`.
    pub path: String,
    /// Mirror host names.
    pub hosts: Vec<String>,
}

/// Parse a versions table into typed entries.
pub fn parse_versions(text: &str) -> Result<Vec<VersionEntry>> {
    let table = PipeTable::parse(text)?;
    let region = table.column("Region", 0);
    let build = table.column("BuildConfig", 1);
    let cdn = table.column("CDNConfig", 2);
    let build_id = table.column("BuildId", usize::MAX);
    let name = table.column("VersionsName", usize::MAX);

    Ok(table
        .rows()
        .iter()
        .map(|row| VersionEntry {
            region: row[region].clone(),
            build_config: row[build].clone(),
            cdn_config: row[cdn].clone(),
            build_id: row.get(build_id).and_then(|v| v.parse().ok()),
            versions_name: row.get(name).cloned().filter(|v| !v.is_empty()),
        })
        .collect())
}

/// Parse a cdns table into typed entries.
pub fn parse_cdns(text: &str) -> Result<Vec<CdnEntry>> {
    let table = PipeTable::parse(text)?;
    let name = table.column("Name", 0);
    let path = table.column("Path", 1);
    let hosts = table.column("Hosts", 2);

    Ok(table
        .rows()
        .iter()
        .map(|row| CdnEntry {
            name: row[name].clone(),
            path: row[path].clone(),
            hosts: row[hosts].split_whitespace().map(str::to_string).collect(),
        })
        .collect())
}
