//! Coverage diffing
//!
//! Compares the coverage the templates expect against what the store already
//! holds, top-down: schemas, then tables within common schemas, then columns
//! and date ranges within common tables. Each table's coverage is a single
//! interval by design, so gaps strictly inside the stored range go
//! undetected; the planner only ever backfills before the stored start and
//! frontfills after the stored end.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use crate::db::gateway::Coverage;

/// Backfill/frontfill windows for one table, `(from, to)` pairs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DateGaps {
    /// Expected start precedes actual start: fill `[expected, actual)`
    pub start: Option<(NaiveDate, NaiveDate)>,
    /// Expected end follows actual end: fill `[actual, expected)`
    pub end: Option<(NaiveDate, NaiveDate)>,
}

impl DateGaps {
    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// The fill windows in calendar order
    pub fn windows(&self) -> Vec<(NaiveDate, NaiveDate)> {
        self.start.into_iter().chain(self.end).collect()
    }
}

/// Column and date-range discrepancies for one table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableDiff {
    pub columns: Vec<String>,
    pub gaps: DateGaps,
}

/// The three projections of a coverage comparison
#[derive(Debug, Default)]
pub struct CoverageDiff {
    /// Desired storage that does not exist yet
    pub missing: BTreeMap<String, BTreeMap<String, TableDiff>>,
    /// Storage no template references (reported, never deleted)
    pub orphaned: BTreeMap<String, BTreeMap<String, TableDiff>>,
    /// Intersections: columns both sides agree on
    pub common: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl CoverageDiff {
    pub fn missing_for(&self, schema: &str, table: &str) -> Option<&TableDiff> {
        self.missing.get(schema).and_then(|tables| tables.get(table))
    }
}

/// Diff expected coverage against actual storage
pub fn diff(expected: &Coverage, actual: &Coverage) -> CoverageDiff {
    let mut out = CoverageDiff::default();

    for (schema, expected_tables) in expected {
        match actual.get(schema) {
            None => {
                // Whole schema missing: everything expected under it is a gap
                let tables = expected_tables
                    .iter()
                    .map(|(table, cov)| (table.clone(), whole_table_missing(cov)))
                    .collect();
                out.missing.insert(schema.clone(), tables);
            }
            Some(actual_tables) => {
                let mut missing_tables = BTreeMap::new();
                let mut common_tables = BTreeMap::new();
                for (table, expected_cov) in expected_tables {
                    match actual_tables.get(table) {
                        None => {
                            missing_tables.insert(table.clone(), whole_table_missing(expected_cov));
                        }
                        Some(actual_cov) => {
                            let missing_columns: Vec<String> = expected_cov
                                .columns
                                .iter()
                                .filter(|column| !actual_cov.columns.contains(column))
                                .cloned()
                                .collect();
                            let common_columns: Vec<String> = expected_cov
                                .columns
                                .iter()
                                .filter(|column| actual_cov.columns.contains(column))
                                .cloned()
                                .collect();
                            let gaps =
                                date_gaps(expected_cov.date_range, actual_cov.date_range);

                            if !missing_columns.is_empty() || !gaps.is_empty() {
                                missing_tables.insert(
                                    table.clone(),
                                    TableDiff {
                                        columns: missing_columns,
                                        gaps,
                                    },
                                );
                            }
                            if !common_columns.is_empty() {
                                common_tables.insert(table.clone(), common_columns);
                            }
                        }
                    }
                }
                if !missing_tables.is_empty() {
                    out.missing.insert(schema.clone(), missing_tables);
                }
                if !common_tables.is_empty() {
                    out.common.insert(schema.clone(), common_tables);
                }
            }
        }
    }

    // Orphans: storage with no expected counterpart
    for (schema, actual_tables) in actual {
        match expected.get(schema) {
            None => {
                let tables = actual_tables
                    .keys()
                    .map(|table| (table.clone(), TableDiff::default()))
                    .collect();
                out.orphaned.insert(schema.clone(), tables);
            }
            Some(expected_tables) => {
                let mut orphaned_tables = BTreeMap::new();
                for (table, actual_cov) in actual_tables {
                    match expected_tables.get(table) {
                        None => {
                            orphaned_tables.insert(table.clone(), TableDiff::default());
                        }
                        Some(expected_cov) => {
                            let orphaned_columns: Vec<String> = actual_cov
                                .columns
                                .iter()
                                .filter(|column| !expected_cov.columns.contains(column))
                                .cloned()
                                .collect();
                            if !orphaned_columns.is_empty() {
                                orphaned_tables.insert(
                                    table.clone(),
                                    TableDiff {
                                        columns: orphaned_columns,
                                        gaps: DateGaps::default(),
                                    },
                                );
                            }
                        }
                    }
                }
                if !orphaned_tables.is_empty() {
                    out.orphaned.insert(schema.clone(), orphaned_tables);
                }
            }
        }
    }

    out
}

fn whole_table_missing(cov: &crate::db::gateway::TableCoverage) -> TableDiff {
    TableDiff {
        columns: cov.columns.clone(),
        gaps: DateGaps {
            start: cov.date_range,
            end: None,
        },
    }
}

fn date_gaps(
    expected: Option<(NaiveDate, NaiveDate)>,
    actual: Option<(NaiveDate, NaiveDate)>,
) -> DateGaps {
    let Some((expected_start, expected_end)) = expected else {
        return DateGaps::default();
    };
    let Some((actual_start, actual_end)) = actual else {
        // Table exists but holds no dated rows: one window covers everything
        return DateGaps {
            start: Some((expected_start, expected_end)),
            end: None,
        };
    };
    DateGaps {
        start: (expected_start < actual_start).then_some((expected_start, actual_start)),
        end: (expected_end > actual_end).then_some((actual_end, expected_end)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::gateway::TableCoverage;

    fn date(s: &str) -> NaiveDate {
        crate::timefmt::parse_date(s).unwrap()
    }

    fn coverage(entries: &[(&str, &str, &[&str], Option<(&str, &str)>)]) -> Coverage {
        let mut out = Coverage::new();
        for (schema, table, columns, range) in entries {
            out.entry(schema.to_string()).or_default().insert(
                table.to_string(),
                TableCoverage {
                    columns: columns.iter().map(|c| c.to_string()).collect(),
                    date_range: range.map(|(a, b)| (date(a), date(b))),
                },
            );
        }
        out
    }

    #[test]
    fn backfill_and_frontfill_windows() {
        let expected = coverage(&[(
            "fred",
            "series_observations",
            &["date", "value"],
            Some(("2020-01-01", "2023-12-31")),
        )]);
        let actual = coverage(&[(
            "fred",
            "series_observations",
            &["date", "value"],
            Some(("2021-01-01", "2023-06-30")),
        )]);

        let diff = diff(&expected, &actual);
        let table = diff.missing_for("fred", "series_observations").unwrap();
        assert_eq!(
            table.gaps.start,
            Some((date("2020-01-01"), date("2021-01-01")))
        );
        assert_eq!(
            table.gaps.end,
            Some((date("2023-06-30"), date("2023-12-31")))
        );
        assert!(table.columns.is_empty());
        assert_eq!(diff.common["fred"]["series_observations"], vec!["date", "value"]);
    }

    #[test]
    fn covered_range_produces_no_gaps() {
        let expected = coverage(&[(
            "fred",
            "t",
            &["date"],
            Some(("2021-01-01", "2022-01-01")),
        )]);
        let actual = coverage(&[(
            "fred",
            "t",
            &["date"],
            Some(("2020-01-01", "2023-01-01")),
        )]);
        let diff = diff(&expected, &actual);
        assert!(diff.missing.is_empty());
    }

    #[test]
    fn missing_schema_cascades_to_tables() {
        let expected = coverage(&[(
            "ibkr",
            "historical_bars",
            &["date", "close"],
            Some(("2020-01-01", "2020-02-01")),
        )]);
        let diff = diff(&expected, &Coverage::new());
        let table = diff.missing_for("ibkr", "historical_bars").unwrap();
        assert_eq!(table.columns, vec!["date", "close"]);
        assert_eq!(
            table.gaps.start,
            Some((date("2020-01-01"), date("2020-02-01")))
        );
    }

    #[test]
    fn missing_columns_within_common_table() {
        let expected = coverage(&[("fred", "series", &["id", "title", "popularity"], None)]);
        let actual = coverage(&[("fred", "series", &["id", "title"], None)]);
        let diff = diff(&expected, &actual);
        let table = diff.missing_for("fred", "series").unwrap();
        assert_eq!(table.columns, vec!["popularity"]);
        assert!(table.gaps.is_empty());
    }

    #[test]
    fn orphans_are_reported_not_planned() {
        let expected = coverage(&[("fred", "series", &["id"], None)]);
        let actual = coverage(&[
            ("fred", "series", &["id", "legacy"], None),
            ("edgar", "facts", &["cik"], None),
        ]);
        let diff = diff(&expected, &actual);
        assert_eq!(diff.orphaned["fred"]["series"].columns, vec!["legacy"]);
        assert!(diff.orphaned["edgar"].contains_key("facts"));
        assert!(diff.missing.is_empty());
    }
}
