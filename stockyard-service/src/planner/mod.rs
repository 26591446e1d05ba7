//! Coverage planner
//!
//! Turns templates into desired coverage, diffs that against what the store
//! holds, and emits the minimal set of urgent fill requests: one request per
//! `(endpoint, missing window)`. Orphaned storage is reported and left alone.

pub mod coverage;
pub mod templates;

pub use coverage::{CoverageDiff, DateGaps, TableDiff};
pub use templates::{TemplateFile, TemplateItem};

use chrono::{Duration, NaiveDate};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::gateway::{Coverage, TableCoverage};
use crate::error::{Error, Result};
use crate::model::request::{Request, RequestParams};
use crate::model::resource::split_encoded;
use crate::vendor::{Vendor, VendorRegistry};

/// One table the templates expect to exist, with the request context needed
/// to fill it
#[derive(Debug, Clone)]
pub struct ExpectedTable {
    pub vendor: String,
    pub endpoint: String,
    pub columns: Vec<String>,
    pub resource: Option<String>,
    pub resolution: Option<Duration>,
    pub range: Option<(NaiveDate, NaiveDate)>,
}

/// Planner over the loaded vendor registry
pub struct Planner {
    registry: Arc<VendorRegistry>,
}

impl Planner {
    pub fn new(registry: Arc<VendorRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve each template item to concrete `(vendor, endpoint)` tables
    pub fn expand(&self, items: &[TemplateItem]) -> Result<Vec<ExpectedTable>> {
        let mut out = Vec::new();
        for item in items {
            let vendor = self.registry.get(&item.vendor)?;
            let selections = match &item.endpoint {
                Some(endpoint) => {
                    let ep = vendor.endpoint(endpoint)?;
                    let columns = if item.columns.is_empty() {
                        ep.returns.iter().map(|f| f.name.to_string()).collect()
                    } else {
                        item.columns.clone()
                    };
                    vec![(endpoint.clone(), columns)]
                }
                None => select_endpoints(vendor, &item.columns)?,
            };
            for (endpoint, columns) in selections {
                out.push(ExpectedTable {
                    vendor: item.vendor.clone(),
                    endpoint,
                    columns,
                    resource: item.resource.clone(),
                    resolution: item.resolution,
                    range: item.start.zip(item.end).map(|(s, e)| (s.date(), e.date())),
                });
            }
        }
        Ok(out)
    }

    /// Merge expected tables into a coverage map keyed like the store:
    /// vendor schema, endpoint table
    pub fn expected_coverage(entries: &[ExpectedTable]) -> Coverage {
        let mut out = Coverage::new();
        for entry in entries {
            let table: &mut TableCoverage = out
                .entry(entry.vendor.clone())
                .or_default()
                .entry(entry.endpoint.clone())
                .or_default();
            for column in &entry.columns {
                if !table.columns.contains(column) {
                    table.columns.push(column.clone());
                }
            }
            if let Some((start, end)) = entry.range {
                table.date_range = Some(match table.date_range {
                    None => (start, end),
                    Some((s, e)) => (s.min(start), e.max(end)),
                });
            }
        }
        out
    }

    /// Full planning pass: expand, diff, emit fill requests
    pub fn plan(&self, items: &[TemplateItem], actual: &Coverage) -> Result<Vec<Request>> {
        let entries = self.expand(items)?;
        let expected = Self::expected_coverage(&entries);
        let diff = coverage::diff(&expected, actual);

        for (schema, tables) in &diff.orphaned {
            for (table, detail) in tables {
                tracing::warn!(
                    schema = %schema,
                    table = %table,
                    columns = ?detail.columns,
                    "orphaned storage (left in place)"
                );
            }
        }

        let mut requests = Vec::new();
        for entry in &entries {
            let Some(table_diff) = diff.missing_for(&entry.vendor, &entry.endpoint) else {
                continue;
            };
            let windows = table_diff.gaps.windows();
            if windows.is_empty() {
                // Structural gap only (new columns on an undated table):
                // one fill over the declared range, if any
                requests.push(self.fill_request(entry, entry.range)?);
                continue;
            }
            for window in windows {
                requests.push(self.fill_request(entry, Some(window))?);
            }
        }
        tracing::info!(count = requests.len(), "fill plan emitted");
        Ok(requests)
    }

    fn fill_request(
        &self,
        entry: &ExpectedTable,
        window: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<Request> {
        let vendor = self.registry.get(&entry.vendor)?;
        let resource = entry
            .resource
            .as_deref()
            .map(|encoded| {
                let (class_name, handle) = split_encoded(encoded)?;
                let class = vendor.resources().get(class_name).ok_or_else(|| {
                    Error::Plan(format!(
                        "vendor {} has no resource class `{class_name}`",
                        entry.vendor
                    ))
                })?;
                class.decode(handle)
            })
            .transpose()?;
        Ok(Request::new(
            entry.vendor.clone(),
            entry.endpoint.clone(),
            RequestParams {
                start: window.map(|(s, _)| s.and_hms_opt(0, 0, 0).unwrap()),
                end: window.map(|(_, e)| e.and_hms_opt(0, 0, 0).unwrap()),
                resolution: entry.resolution,
                resource,
            },
        ))
    }
}

/// Pick the endpoints supplying a column set
///
/// Prefer the single endpoint whose returns cover every required column with
/// the fewest extras; fall back to a greedy multi-endpoint cover; error when
/// a residual remains.
fn select_endpoints(vendor: &Vendor, columns: &[String]) -> Result<Vec<(String, Vec<String>)>> {
    if columns.is_empty() {
        return Err(Error::Plan(format!(
            "vendor {}: template names neither an endpoint nor required columns",
            vendor.name
        )));
    }

    // Single-endpoint cover with the smallest surplus
    let mut best: Option<(&str, usize)> = None;
    for (name, endpoint) in vendor.endpoints() {
        let returned: Vec<&str> = endpoint.returns.iter().map(|f| f.name).collect();
        if columns.iter().all(|c| returned.contains(&c.as_str())) {
            let extras = returned.len() - columns.len();
            if best.is_none_or(|(_, e)| extras < e) {
                best = Some((name, extras));
            }
        }
    }
    if let Some((name, _)) = best {
        return Ok(vec![(name.to_string(), columns.to_vec())]);
    }

    // Greedy multi-endpoint cover
    let mut remaining: Vec<String> = columns.to_vec();
    let mut picked: BTreeMap<String, Vec<String>> = BTreeMap::new();
    while !remaining.is_empty() {
        let mut round_best: Option<(&str, Vec<String>)> = None;
        for (name, endpoint) in vendor.endpoints() {
            let returned: Vec<&str> = endpoint.returns.iter().map(|f| f.name).collect();
            let covered: Vec<String> = remaining
                .iter()
                .filter(|c| returned.contains(&c.as_str()))
                .cloned()
                .collect();
            if round_best
                .as_ref()
                .is_none_or(|(_, best_covered)| covered.len() > best_covered.len())
                && !covered.is_empty()
            {
                round_best = Some((name, covered));
            }
        }
        let Some((name, covered)) = round_best else {
            return Err(Error::Plan(format!(
                "vendor {}: no endpoint supplies columns {remaining:?}",
                vendor.name
            )));
        };
        remaining.retain(|c| !covered.contains(c));
        picked.entry(name.to_string()).or_default().extend(covered);
    }
    Ok(picked.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::CorrIdSource;
    use crate::model::{Context, Field, FieldDef, FieldKind, Request, ResourceClass};
    use crate::vendor::getter::{Call, EndpointSpec, Raw};
    use crate::vendor::VendorSpec;
    use async_trait::async_trait;

    struct NoopCall;

    #[async_trait]
    impl Call for NoopCall {
        async fn call(&self, _request: Request) -> Result<Raw> {
            Ok(Raw::Records(vec![]))
        }
    }

    const OBS_RETURNS: &[Field] = &[
        Field::new("date", FieldKind::Date),
        Field::new("value", FieldKind::Float),
    ];
    const META_RETURNS: &[Field] = &[
        Field::new("id", FieldKind::Text),
        Field::new("title", FieldKind::Text),
        Field::new("popularity", FieldKind::Int),
    ];
    const WIDE_RETURNS: &[Field] = &[
        Field::new("date", FieldKind::Date),
        Field::new("value", FieldKind::Float),
        Field::new("id", FieldKind::Text),
        Field::new("title", FieldKind::Text),
    ];

    fn registry() -> Arc<VendorRegistry> {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("observations", EndpointSpec::new(OBS_RETURNS, Arc::new(NoopCall)));
        endpoints.insert("meta", EndpointSpec::new(META_RETURNS, Arc::new(NoopCall)));
        endpoints.insert("wide", EndpointSpec::new(WIDE_RETURNS, Arc::new(NoopCall)));
        let spec = VendorSpec {
            name: "fred",
            context: Context::default(),
            corr_ids: CorrIdSource::Uuid,
            endpoints,
            resources: vec![ResourceClass::new(
                "Series",
                vec![],
                vec![FieldDef::required(Field::new("series_id", FieldKind::Text))],
                vec!["series_id"],
            )],
            runner: None,
        };
        Arc::new(VendorRegistry::from_specs(vec![spec]))
    }

    fn item(columns: &[&str], range: Option<(&str, &str)>) -> TemplateItem {
        TemplateItem {
            vendor: "fred".into(),
            endpoint: None,
            resource: Some("Series$GDP".into()),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            start: range.map(|(s, _)| crate::timefmt::parse_timestamp(s).unwrap()),
            end: range.map(|(_, e)| crate::timefmt::parse_timestamp(e).unwrap()),
            resolution: Some(Duration::days(1)),
        }
    }

    #[test]
    fn selection_prefers_smallest_superset() {
        let registry = registry();
        let vendor = registry.get("fred").unwrap();
        let picked = select_endpoints(vendor, &["date".into(), "value".into()]).unwrap();
        assert_eq!(picked, vec![("observations".to_string(), vec!["date".to_string(), "value".to_string()])]);
    }

    #[test]
    fn selection_falls_back_to_greedy_cover() {
        let registry = registry();
        let vendor = registry.get("fred").unwrap();
        let picked =
            select_endpoints(vendor, &["popularity".into(), "value".into()]).unwrap();
        let names: Vec<&str> = picked.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["meta", "observations"]);
        assert_eq!(picked[0].1, vec!["popularity".to_string()]);
        assert_eq!(picked[1].1, vec!["value".to_string()]);
    }

    #[test]
    fn selection_errors_on_residual() {
        let registry = registry();
        let vendor = registry.get("fred").unwrap();
        assert!(select_endpoints(vendor, &["no_such_column".into()]).is_err());
    }

    #[test]
    fn plan_emits_backfill_and_frontfill() {
        let registry = registry();
        let planner = Planner::new(Arc::clone(&registry));
        let items = vec![item(&["date", "value"], Some(("2020-01-01T00:00:00", "2023-12-31T00:00:00")))];

        let mut actual = Coverage::new();
        actual.entry("fred".into()).or_default().insert(
            "observations".into(),
            TableCoverage {
                columns: vec!["date".into(), "value".into()],
                date_range: Some((
                    crate::timefmt::parse_date("2021-01-01").unwrap(),
                    crate::timefmt::parse_date("2023-06-30").unwrap(),
                )),
            },
        );

        let requests = planner.plan(&items, &actual).unwrap();
        assert_eq!(requests.len(), 2);

        let backfill = &requests[0];
        assert_eq!(backfill.endpoint, "observations");
        assert_eq!(
            backfill.params.start.unwrap(),
            crate::timefmt::parse_timestamp("2020-01-01T00:00:00").unwrap()
        );
        assert_eq!(
            backfill.params.end.unwrap(),
            crate::timefmt::parse_timestamp("2021-01-01T00:00:00").unwrap()
        );
        let frontfill = &requests[1];
        assert_eq!(
            frontfill.params.start.unwrap(),
            crate::timefmt::parse_timestamp("2023-06-30T00:00:00").unwrap()
        );
        assert_eq!(
            frontfill.params.end.unwrap(),
            crate::timefmt::parse_timestamp("2023-12-31T00:00:00").unwrap()
        );
        // The fill requests carry the reified resource
        assert_eq!(
            backfill.params.resource.as_ref().unwrap().encode(),
            "Series$GDP"
        );
    }

    #[test]
    fn plan_is_empty_when_coverage_is_complete() {
        let registry = registry();
        let planner = Planner::new(Arc::clone(&registry));
        let items = vec![item(&["date", "value"], Some(("2021-01-01T00:00:00", "2022-01-01T00:00:00")))];

        let mut actual = Coverage::new();
        actual.entry("fred".into()).or_default().insert(
            "observations".into(),
            TableCoverage {
                columns: vec!["date".into(), "value".into()],
                date_range: Some((
                    crate::timefmt::parse_date("2020-01-01").unwrap(),
                    crate::timefmt::parse_date("2023-01-01").unwrap(),
                )),
            },
        );
        assert!(planner.plan(&items, &actual).unwrap().is_empty());
    }

    #[test]
    fn plan_against_empty_store_fills_whole_range() {
        let registry = registry();
        let planner = Planner::new(Arc::clone(&registry));
        let items = vec![item(&["date", "value"], Some(("2020-01-01T00:00:00", "2020-06-01T00:00:00")))];
        let requests = planner.plan(&items, &Coverage::new()).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].params.start.unwrap(),
            crate::timefmt::parse_timestamp("2020-01-01T00:00:00").unwrap()
        );
    }
}
