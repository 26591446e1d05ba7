//! Request templates
//!
//! Templates are JSON files in the templates directory, each carrying a
//! shared `common` block and a `templates` array. Decoding is strict: an
//! unknown key or a malformed value anywhere aborts the whole load, which is
//! what keeps a bad template from silently planning nothing.

use chrono::{Duration, NaiveDateTime};
use serde::Deserialize;
use std::path::Path;

use crate::error::{Error, Result};
use crate::timefmt;

/// Shared defaults applied to every entry of a template file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateCommon {
    pub vendor: Option<String>,
    pub endpoint: Option<String>,
    pub columns: Option<Vec<String>>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub resolution: Option<String>,
}

/// One desired request shape
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateEntry {
    pub vendor: Option<String>,
    pub endpoint: Option<String>,
    /// Serialized resource: `<ClassName>$<handle>`
    pub resource: Option<String>,
    pub columns: Option<Vec<String>>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub resolution: Option<String>,
}

/// On-disk template file shape
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateFile {
    #[serde(default)]
    pub common: TemplateCommon,
    pub templates: Vec<TemplateEntry>,
}

/// A flattened, parsed template entry
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateItem {
    pub vendor: String,
    pub endpoint: Option<String>,
    pub resource: Option<String>,
    pub columns: Vec<String>,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub resolution: Option<Duration>,
}

/// Merge the common block into each entry and parse temporal fields
pub fn flatten(file: TemplateFile) -> Result<Vec<TemplateItem>> {
    let common = file.common;
    file.templates
        .into_iter()
        .map(|entry| {
            let vendor = entry
                .vendor
                .or_else(|| common.vendor.clone())
                .ok_or_else(|| Error::Template("entry has no vendor".into()))?;
            let start = entry
                .start
                .or_else(|| common.start.clone())
                .as_deref()
                .map(timefmt::parse_timestamp)
                .transpose()?;
            let end = entry
                .end
                .or_else(|| common.end.clone())
                .as_deref()
                .map(timefmt::parse_timestamp)
                .transpose()?;
            let resolution = entry
                .resolution
                .or_else(|| common.resolution.clone())
                .as_deref()
                .map(timefmt::parse_duration)
                .transpose()?;
            Ok(TemplateItem {
                vendor,
                endpoint: entry.endpoint.or_else(|| common.endpoint.clone()),
                resource: entry.resource,
                columns: entry
                    .columns
                    .or_else(|| common.columns.clone())
                    .unwrap_or_default(),
                start,
                end,
                resolution,
            })
        })
        .collect()
}

/// Load and flatten every template in a directory
///
/// Files whose names start with `_` are schema/support files and skipped.
/// Any parse failure aborts the load.
pub fn load_dir(dir: &Path) -> Result<Vec<TemplateItem>> {
    let mut items = Vec::new();
    if !dir.exists() {
        tracing::warn!(dir = %dir.display(), "templates directory does not exist");
        return Ok(items);
    }
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('_'))
        })
        .collect();
    entries.sort();

    for path in entries {
        let raw = std::fs::read_to_string(&path)?;
        let file: TemplateFile = serde_json::from_str(&raw)
            .map_err(|e| Error::Template(format!("{}: {e}", path.display())))?;
        items.extend(flatten(file)?);
    }
    tracing::info!(count = items.len(), "templates loaded");
    Ok(items)
}
