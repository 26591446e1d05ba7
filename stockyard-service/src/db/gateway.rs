//! Persistence gateway
//!
//! Declarative commands over a fixed set of SQL templates. Identifiers only
//! ever reach a statement through [`quote_ident`]; values only ever travel as
//! bind parameters (or COPY text, which is value-encoded, never spliced into
//! SQL). Vendor responses land in `(vendor schema, endpoint table)` with
//! column types taken from the endpoint's declared return fields.
//!
//! Failure policy: any database error closes the pool and propagates; the
//! caller owns retries.

use chrono::NaiveDate;
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgArguments, PgPoolCopyExt};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::model::{Field, FieldKind, Record, Scalar};
use crate::timefmt;

/// Row-count threshold above which inserts switch to COPY
const BULK_THRESHOLD: usize = 500;
/// Keep each multi-row INSERT under the wire limit on bind parameters
const MAX_BIND_PARAMS: usize = 30_000;

/// Fixed SQL templates; `%name%` slots take quoted identifiers only
mod sql {
    pub const CREATE_SCHEMA: &str = "CREATE SCHEMA IF NOT EXISTS %schema%;";
    pub const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS %schema%.%table% (%columns%);";
    pub const CREATE_COLUMN: &str =
        "ALTER TABLE %schema%.%table% ADD COLUMN IF NOT EXISTS %column% %type%;";
    pub const INSERT: &str = "INSERT INTO %schema%.%table% (%columns%) VALUES %values%;";
    pub const COPY_BULK: &str = "COPY %schema%.%table% (%columns%) FROM STDIN;";
    pub const SELECT_ALL: &str = "SELECT * FROM %schema%.%table%;";
    pub const DELETE_SCHEMA: &str = "DROP SCHEMA IF EXISTS %schema% CASCADE;";
    pub const DELETE_TABLE: &str = "DROP TABLE IF EXISTS %schema%.%table% CASCADE;";
    pub const DELETE_RECORDS: &str = "DELETE FROM %schema%.%table%;";
    pub const LIST_SCHEMAS: &str = "SELECT schema_name FROM information_schema.schemata \
         WHERE schema_name NOT IN ('pg_catalog', 'information_schema', 'pg_toast', 'public');";
    pub const LIST_TABLES: &str =
        "SELECT table_name FROM information_schema.tables WHERE table_schema = $1;";
    pub const LIST_COLUMNS: &str = "SELECT column_name, data_type FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position;";
    pub const CHECK_DATE_RANGE: &str = "SELECT min(%date%), max(%date%) FROM %schema%.%table%;";
    pub const CHECK_RECORDS: &str = "SELECT count(*) FROM %schema%.%table%;";
}

/// Quote an identifier for Postgres: wrap in double quotes, double any
/// embedded quote. This is the single path every schema/table/column name
/// takes into a statement.
pub fn quote_ident(ident: &str) -> Result<String> {
    if ident.is_empty() || ident.contains('\0') {
        return Err(Error::BadRequest(format!("invalid identifier `{ident}`")));
    }
    Ok(format!("\"{}\"", ident.replace('"', "\"\"")))
}

fn render(template: &str, slots: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in slots {
        out = out.replace(&format!("%{name}%"), value);
    }
    out
}

/// Per-table coverage: columns plus the stored date interval, if dated
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableCoverage {
    pub columns: Vec<String>,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
}

/// `{schema → {table → coverage}}` — the planner's sole input
pub type Coverage = BTreeMap<String, BTreeMap<String, TableCoverage>>;

/// Declarative command surface over one connection pool
pub struct Gateway {
    pool: PgPool,
}

impl Gateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Close the pool on failure and propagate, per the failure policy
    async fn fail<T>(&self, e: sqlx::Error) -> Result<T> {
        tracing::error!(error = %e, "database failure, closing pool");
        self.pool.close().await;
        Err(Error::Database(e))
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        match sqlx::query(statement).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(e) => self.fail(e).await,
        }
    }

    pub async fn create_schema(&self, schema: &str) -> Result<()> {
        let statement = render(sql::CREATE_SCHEMA, &[("schema", &quote_ident(schema)?)]);
        self.execute(&statement).await
    }

    pub async fn create_table(&self, schema: &str, table: &str, columns: &[Field]) -> Result<()> {
        let column_defs = columns
            .iter()
            .map(|field| Ok(format!("{} {}", quote_ident(field.name)?, field.kind.pg_type())))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let statement = render(
            sql::CREATE_TABLE,
            &[
                ("schema", &quote_ident(schema)?),
                ("table", &quote_ident(table)?),
                ("columns", &column_defs),
            ],
        );
        self.execute(&statement).await
    }

    /// Add any declared column the table is missing (idempotent)
    pub async fn create_columns(&self, schema: &str, table: &str, columns: &[Field]) -> Result<()> {
        for field in columns {
            let statement = render(
                sql::CREATE_COLUMN,
                &[
                    ("schema", &quote_ident(schema)?),
                    ("table", &quote_ident(table)?),
                    ("column", &quote_ident(field.name)?),
                    ("type", &field.kind.pg_type().to_string()),
                ],
            );
            self.execute(&statement).await?;
        }
        Ok(())
    }

    /// Multi-row INSERT with placeholder-bound values
    pub async fn insert(
        &self,
        schema: &str,
        table: &str,
        columns: &[Field],
        rows: &[Record],
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let width = columns.len();
        let rows_per_batch = (MAX_BIND_PARAMS / width).max(1);

        for batch in rows.chunks(rows_per_batch) {
            let values = (0..batch.len())
                .map(|row_ix| {
                    let placeholders = (0..width)
                        .map(|col_ix| format!("${}", row_ix * width + col_ix + 1))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("({placeholders})")
                })
                .collect::<Vec<_>>()
                .join(", ");
            let column_names = columns
                .iter()
                .map(|field| quote_ident(field.name))
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            let statement = render(
                sql::INSERT,
                &[
                    ("schema", &quote_ident(schema)?),
                    ("table", &quote_ident(table)?),
                    ("columns", &column_names),
                    ("values", &values),
                ],
            );

            let mut query = sqlx::query(&statement);
            for row in batch {
                for (field, value) in columns.iter().zip(row) {
                    query = bind_scalar(query, field.kind, value)?;
                }
            }
            if let Err(e) = query.execute(&self.pool).await {
                return self.fail(e).await;
            }
        }
        Ok(())
    }

    /// Bulk insert via `COPY ... FROM STDIN` in text format
    pub async fn copy_bulk(
        &self,
        schema: &str,
        table: &str,
        columns: &[Field],
        rows: &[Record],
    ) -> Result<()> {
        let column_names = columns
            .iter()
            .map(|field| quote_ident(field.name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let statement = render(
            sql::COPY_BULK,
            &[
                ("schema", &quote_ident(schema)?),
                ("table", &quote_ident(table)?),
                ("columns", &column_names),
            ],
        );

        let mut buf = String::new();
        for row in rows {
            let line = row
                .iter()
                .map(copy_text)
                .collect::<Vec<_>>()
                .join("\t");
            buf.push_str(&line);
            buf.push('\n');
        }

        let result = async {
            let mut copy_in = self.pool.copy_in_raw(&statement).await?;
            copy_in.send(buf.as_bytes()).await?;
            copy_in.finish().await?;
            Ok::<_, sqlx::Error>(())
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e).await,
        }
    }

    /// Persist one response batch, creating schema/table/columns on demand
    pub async fn store_response(
        &self,
        vendor: &str,
        endpoint: &str,
        returns: &[Field],
        rows: &[Record],
    ) -> Result<()> {
        self.create_schema(vendor).await?;
        self.create_table(vendor, endpoint, returns).await?;
        self.create_columns(vendor, endpoint, returns).await?;
        if rows.len() >= BULK_THRESHOLD {
            self.copy_bulk(vendor, endpoint, returns, rows).await
        } else {
            self.insert(vendor, endpoint, returns, rows).await
        }
    }

    pub async fn list_schemas(&self) -> Result<Vec<String>> {
        match sqlx::query(sql::LIST_SCHEMAS).fetch_all(&self.pool).await {
            Ok(rows) => Ok(rows.iter().map(|row| row.get(0)).collect()),
            Err(e) => self.fail(e).await,
        }
    }

    pub async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        match sqlx::query(sql::LIST_TABLES)
            .bind(schema)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => Ok(rows.iter().map(|row| row.get(0)).collect()),
            Err(e) => self.fail(e).await,
        }
    }

    pub async fn list_columns(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<(String, Option<FieldKind>)>> {
        match sqlx::query(sql::LIST_COLUMNS)
            .bind(schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => Ok(rows
                .iter()
                .map(|row| {
                    let name: String = row.get(0);
                    let data_type: String = row.get(1);
                    (name, FieldKind::from_pg_type(&data_type))
                })
                .collect()),
            Err(e) => self.fail(e).await,
        }
    }

    /// `(min, max)` of the table's date column, if it holds any rows
    pub async fn check_date_range(
        &self,
        schema: &str,
        table: &str,
        date_column: &str,
    ) -> Result<Option<(NaiveDate, NaiveDate)>> {
        let statement = render(
            sql::CHECK_DATE_RANGE,
            &[
                ("date", &quote_ident(date_column)?),
                ("schema", &quote_ident(schema)?),
                ("table", &quote_ident(table)?),
            ],
        );
        match sqlx::query(&statement).fetch_one(&self.pool).await {
            Ok(row) => {
                let min: Option<NaiveDate> = row.get(0);
                let max: Option<NaiveDate> = row.get(1);
                Ok(min.zip(max))
            }
            Err(e) => self.fail(e).await,
        }
    }

    pub async fn check_records(&self, schema: &str, table: &str) -> Result<i64> {
        let statement = render(
            sql::CHECK_RECORDS,
            &[("schema", &quote_ident(schema)?), ("table", &quote_ident(table)?)],
        );
        match sqlx::query(&statement).fetch_one(&self.pool).await {
            Ok(row) => Ok(row.get(0)),
            Err(e) => self.fail(e).await,
        }
    }

    pub async fn select_all(&self, schema: &str, table: &str) -> Result<u64> {
        let statement = render(
            sql::SELECT_ALL,
            &[("schema", &quote_ident(schema)?), ("table", &quote_ident(table)?)],
        );
        match sqlx::query(&statement).fetch_all(&self.pool).await {
            Ok(rows) => Ok(rows.len() as u64),
            Err(e) => self.fail(e).await,
        }
    }

    pub async fn delete_records(&self, schema: &str, table: &str) -> Result<()> {
        let statement = render(
            sql::DELETE_RECORDS,
            &[("schema", &quote_ident(schema)?), ("table", &quote_ident(table)?)],
        );
        self.execute(&statement).await
    }

    pub async fn delete_table(&self, schema: &str, table: &str) -> Result<()> {
        let statement = render(
            sql::DELETE_TABLE,
            &[("schema", &quote_ident(schema)?), ("table", &quote_ident(table)?)],
        );
        self.execute(&statement).await
    }

    pub async fn delete_schema(&self, schema: &str) -> Result<()> {
        let statement = render(sql::DELETE_SCHEMA, &[("schema", &quote_ident(schema)?)]);
        self.execute(&statement).await
    }

    /// Introspect the whole store into the coverage map
    pub async fn snapshot(&self) -> Result<Coverage> {
        let mut coverage = Coverage::new();
        for schema in self.list_schemas().await? {
            let mut tables = BTreeMap::new();
            for table in self.list_tables(&schema).await? {
                let columns = self.list_columns(&schema, &table).await?;
                let dated = columns
                    .iter()
                    .any(|(name, kind)| name == "date" && *kind == Some(FieldKind::Date));
                let date_range = if dated {
                    self.check_date_range(&schema, &table, "date").await?
                } else {
                    None
                };
                tables.insert(
                    table,
                    TableCoverage {
                        columns: columns.into_iter().map(|(name, _)| name).collect(),
                        date_range,
                    },
                );
            }
            coverage.insert(schema, tables);
        }
        Ok(coverage)
    }
}

/// Bind one scalar with the column's type, so nulls carry the right type
fn bind_scalar<'q>(
    query: Query<'q, Postgres, PgArguments>,
    kind: FieldKind,
    value: &'q Scalar,
) -> Result<Query<'q, Postgres, PgArguments>> {
    let mismatch = || Error::SchemaDrift(format!("value {value:?} does not fit column type {kind}"));
    Ok(match kind {
        FieldKind::Text => match value {
            Scalar::Text(s) => query.bind(Some(s.as_str())),
            Scalar::Null => query.bind(None::<&str>),
            _ => return Err(mismatch()),
        },
        FieldKind::Bool => match value {
            Scalar::Bool(b) => query.bind(Some(*b)),
            Scalar::Null => query.bind(None::<bool>),
            _ => return Err(mismatch()),
        },
        FieldKind::Int => match value {
            Scalar::Int(n) => query.bind(Some(*n)),
            Scalar::Null => query.bind(None::<i64>),
            _ => return Err(mismatch()),
        },
        FieldKind::Float => match value {
            Scalar::Float(f) => query.bind(Some(*f)),
            Scalar::Int(n) => query.bind(Some(*n as f64)),
            Scalar::Null => query.bind(None::<f64>),
            _ => return Err(mismatch()),
        },
        FieldKind::Date => match value {
            Scalar::Date(d) => query.bind(Some(*d)),
            Scalar::Null => query.bind(None::<NaiveDate>),
            _ => return Err(mismatch()),
        },
        FieldKind::Time => match value {
            Scalar::Time(t) => query.bind(Some(*t)),
            Scalar::Null => query.bind(None::<chrono::NaiveTime>),
            _ => return Err(mismatch()),
        },
        FieldKind::Timestamp => match value {
            Scalar::Timestamp(dt) => query.bind(Some(*dt)),
            Scalar::Null => query.bind(None::<chrono::NaiveDateTime>),
            _ => return Err(mismatch()),
        },
        FieldKind::Interval => match value {
            Scalar::Interval(d) => query.bind(Some(PgInterval {
                months: 0,
                days: 0,
                microseconds: d.num_microseconds().unwrap_or(i64::MAX),
            })),
            Scalar::Null => query.bind(None::<PgInterval>),
            _ => return Err(mismatch()),
        },
    })
}

/// COPY text-format encoding for one scalar
fn copy_text(value: &Scalar) -> String {
    match value {
        Scalar::Null => "\\N".to_string(),
        Scalar::Text(s) => s
            .replace('\\', "\\\\")
            .replace('\t', "\\t")
            .replace('\n', "\\n")
            .replace('\r', "\\r"),
        Scalar::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        Scalar::Int(n) => n.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Date(d) => timefmt::format_date(*d),
        Scalar::Time(t) => timefmt::format_time(*t),
        Scalar::Timestamp(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        Scalar::Interval(d) => timefmt::format_duration(*d),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("series").unwrap(), "\"series\"");
        assert_eq!(quote_ident("we\"ird").unwrap(), "\"we\"\"ird\"");
        assert!(quote_ident("").is_err());
        assert!(quote_ident("nul\0byte").is_err());
    }

    #[test]
    fn templates_render_quoted_identifiers_only() {
        let statement = render(
            sql::CREATE_TABLE,
            &[
                ("schema", &quote_ident("fred").unwrap()),
                ("table", &quote_ident("series_observations").unwrap()),
                ("columns", &"\"date\" date, \"value\" double precision".to_string()),
            ],
        );
        assert_eq!(
            statement,
            "CREATE TABLE IF NOT EXISTS \"fred\".\"series_observations\" \
             (\"date\" date, \"value\" double precision);"
        );
    }

    #[test]
    fn injection_in_names_stays_inert() {
        let statement = render(
            sql::DELETE_TABLE,
            &[
                ("schema", &quote_ident("x\"; DROP TABLE users; --").unwrap()),
                ("table", &quote_ident("t").unwrap()),
            ],
        );
        assert_eq!(
            statement,
            "DROP TABLE IF EXISTS \"x\"\"; DROP TABLE users; --\".\"t\" CASCADE;"
        );
    }

    #[test]
    fn copy_text_escapes_control_characters() {
        assert_eq!(copy_text(&Scalar::Null), "\\N");
        assert_eq!(copy_text(&Scalar::Text("a\tb\nc".into())), "a\\tb\\nc");
        assert_eq!(copy_text(&Scalar::Bool(true)), "t");
        assert_eq!(
            copy_text(&Scalar::Date(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap())),
            "2020-01-01"
        );
    }

    #[test]
    fn insert_statement_shape() {
        // Mirror the statement assembly used by insert(): 2 columns × 2 rows
        let values = "($1, $2), ($3, $4)";
        let statement = render(
            sql::INSERT,
            &[
                ("schema", &quote_ident("fred").unwrap()),
                ("table", &quote_ident("series").unwrap()),
                ("columns", &"\"id\", \"value\"".to_string()),
                ("values", &values.to_string()),
            ],
        );
        assert_eq!(
            statement,
            "INSERT INTO \"fred\".\"series\" (\"id\", \"value\") VALUES ($1, $2), ($3, $4);"
        );
    }
}
