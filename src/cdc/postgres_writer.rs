// ABOUTME: PostgresWriter - applies decoder outputs to a target PostgreSQL table
// ABOUTME: Upserts via INSERT ... ON CONFLICT DO UPDATE, deletes via DELETE ... WHERE pk IN

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use std::collections::{HashMap, HashSet};
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use super::atomic_batch::{merge_tail, AtomicBatch, TailChange};
use super::batch::{Batch, Value};
use super::key::{decode_key, encode_key};
use super::output::DecoderOutput;
use super::sinker::SinkWriter;
use super::table::TableDef;

/// PostgreSQL accepts at most 65535 bind parameters per statement.
const MAX_PARAMS: usize = 65000;

type BoundValue = Box<dyn ToSql + Sync + Send>;

/// Writes one source table into `schema.<table>` on the target.
///
/// Values are bound as typed parameters, converted by the declared type of
/// the target column. Rows per statement are capped by `max_statement_rows`
/// and by the bind parameter limit.
pub struct PostgresWriter {
    client: Client,
    table: TableDef,
    schema: String,
    column_types: HashMap<String, String>,
    max_statement_rows: usize,
    in_txn: bool,
}

impl PostgresWriter {
    /// `column_types` maps target column names to their `information_schema` data type.
    pub fn new(
        client: Client,
        table: TableDef,
        schema: &str,
        column_types: Vec<(String, String)>,
        max_statement_rows: usize,
    ) -> Self {
        Self {
            client,
            table,
            schema: schema.to_string(),
            column_types: column_types.into_iter().collect(),
            max_statement_rows: max_statement_rows.max(1),
            in_txn: false,
        }
    }

    /// Connect to `url` over TLS and build a writer for `table`.
    pub async fn connect(
        url: &str,
        table: TableDef,
        schema: &str,
        max_statement_rows: usize,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .context("Failed to build TLS connector")?;
        let tls = postgres_native_tls::MakeTlsConnector::new(connector);

        let (client, connection) = tokio_postgres::connect(url, tls)
            .await
            .context("Failed to connect to target database")?;
        let key = table.key.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Target connection for {} closed: {}", key, e);
            }
        });

        let column_types = get_table_columns(&client, schema, &table.key.table).await?;
        let missing: Vec<&str> = table
            .columns
            .iter()
            .filter(|col| !column_types.iter().any(|(name, _)| name == *col))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            bail!(
                "Target table {}.{} lacks columns: {}",
                schema,
                table.key.table,
                missing.join(", ")
            );
        }

        Ok(Self::new(client, table, schema, column_types, max_statement_rows))
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.client.batch_execute(sql).await.with_context(|| {
            format!(
                "Failed to run {} on {}.{}",
                sql, self.schema, self.table.key.table
            )
        })
    }

    async fn execute_bound(&self, sql: &str, bound: &[BoundValue]) -> Result<u64> {
        tracing::trace!("Executing on target with {} parameters: {}", bound.len(), sql);
        let params: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();
        self.client.execute(sql, &params).await.with_context(|| {
            format!(
                "Failed to apply changes to {}.{}",
                self.schema, self.table.key.table
            )
        })
    }

    fn column_type(&self, column: &str) -> Result<&str> {
        self.column_types
            .get(column)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("target table has no column {}", column))
    }

    /// Bind `values` against `columns`, position by position.
    fn bind_row<'a>(
        &self,
        columns: &[String],
        values: impl IntoIterator<Item = &'a Value>,
    ) -> Result<Vec<BoundValue>> {
        columns
            .iter()
            .zip(values)
            .map(|(col, value)| {
                bind_value(value, self.column_type(col)?)
                    .with_context(|| format!("Failed to bind column {} of {}", col, self.table.key))
            })
            .collect()
    }

    fn rows_per_statement(&self, params_per_row: usize) -> usize {
        self.max_statement_rows
            .min(MAX_PARAMS / params_per_row.max(1))
            .max(1)
    }

    /// Upsert rows given in visible-column order, chunked.
    async fn upsert_rows(&self, rows: &[Vec<&Value>]) -> Result<usize> {
        let columns = &self.table.columns;
        for chunk in rows.chunks(self.rows_per_statement(columns.len())) {
            let sql = build_upsert_query(
                &self.schema,
                &self.table.key.table,
                &self.table.primary_key,
                columns,
                chunk.len(),
            );
            let mut bound = Vec::with_capacity(chunk.len() * columns.len());
            for row in chunk {
                bound.extend(self.bind_row(columns, row.iter().copied())?);
            }
            self.execute_bound(&sql, &bound).await?;
        }
        Ok(rows.len())
    }

    async fn delete_keys(&self, keys: &[Vec<Value>]) -> Result<usize> {
        let pk_columns = &self.table.primary_key;
        for chunk in keys.chunks(self.rows_per_statement(pk_columns.len())) {
            let sql = build_delete_query(
                &self.schema,
                &self.table.key.table,
                pk_columns,
                chunk.len(),
            );
            let mut bound = Vec::with_capacity(chunk.len() * pk_columns.len());
            for key in chunk {
                bound.extend(self.bind_row(pk_columns, key)?);
            }
            self.execute_bound(&sql, &bound).await?;
        }
        Ok(keys.len())
    }

    async fn apply_snapshot(&self, batch: &Batch) -> Result<usize> {
        let positions = self
            .table
            .columns
            .iter()
            .map(|col| {
                batch
                    .column_index(col)
                    .ok_or_else(|| anyhow!("snapshot batch of {} lacks column {}", self.table.key, col))
            })
            .collect::<Result<Vec<_>>>()?;

        let rows: Vec<Vec<&Value>> = batch
            .rows()
            .iter()
            .map(|row| positions.iter().map(|&i| &row[i]).collect())
            .collect();
        self.upsert_rows(&rows).await
    }

    /// Apply tail changes in commit order, one statement group per run of the same kind.
    async fn apply_tail(&self, inserts: &AtomicBatch, deletes: &AtomicBatch) -> Result<usize> {
        let visible = self.table.columns.len();
        let pk_positions = self.table.primary_key_positions();
        let mut applied = 0;
        let mut pending_inserts: Vec<Vec<&Value>> = Vec::new();
        let mut pending_deletes: Vec<Vec<Value>> = Vec::new();

        for change in merge_tail(inserts, deletes) {
            match change {
                TailChange::Insert(_, row) => {
                    if !pending_deletes.is_empty() {
                        applied += self.delete_keys(&pending_deletes).await?;
                        pending_deletes.clear();
                    }
                    if row.len() < visible {
                        bail!(
                            "inserted row of {} has {} values, expected at least {}",
                            self.table.key,
                            row.len(),
                            visible
                        );
                    }
                    pending_inserts.push(row[..visible].iter().collect());
                }
                TailChange::Delete(_, row) => {
                    if !pending_inserts.is_empty() {
                        let rows = dedup_by_key(pending_inserts, &pk_positions);
                        applied += self.upsert_rows(&rows).await?;
                        pending_inserts = Vec::new();
                    }
                    pending_deletes.push(self.delete_key(row)?);
                }
            }
        }

        if !pending_deletes.is_empty() {
            applied += self.delete_keys(&pending_deletes).await?;
        }
        if !pending_inserts.is_empty() {
            let rows = dedup_by_key(pending_inserts, &pk_positions);
            applied += self.upsert_rows(&rows).await?;
        }
        Ok(applied)
    }

    /// Primary-key values of a delete row, decoding a composite key.
    fn delete_key(&self, row: &[Value]) -> Result<Vec<Value>> {
        let pk = row
            .first()
            .ok_or_else(|| anyhow!("deleted row of {} is empty", self.table.key))?;
        if !self.table.has_composite_pk() {
            return Ok(vec![pk.clone()]);
        }
        let Value::Bytes(encoded) = pk else {
            bail!(
                "composite key of {} must be bytes, got {}",
                self.table.key,
                pk.type_name()
            );
        };
        let values = decode_key(encoded)
            .with_context(|| format!("Failed to decode composite key of {}", self.table.key))?;
        if values.len() != self.table.primary_key.len() {
            bail!(
                "composite key of {} has {} parts, expected {}",
                self.table.key,
                values.len(),
                self.table.primary_key.len()
            );
        }
        Ok(values)
    }
}

#[async_trait]
impl SinkWriter for PostgresWriter {
    async fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN").await?;
        self.in_txn = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.in_txn = false;
        self.execute("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.in_txn = false;
        self.execute("ROLLBACK").await
    }

    async fn apply(&mut self, output: DecoderOutput) -> Result<()> {
        match output {
            DecoderOutput::Snapshot { batch, range } => {
                let rows = self.apply_snapshot(&batch).await?;
                tracing::debug!("Applied {} snapshot rows of {} in {}", rows, self.table.key, range);
            }
            DecoderOutput::Tail {
                inserts,
                deletes,
                range,
            } => {
                let rows = self.apply_tail(&inserts, &deletes).await?;
                tracing::debug!("Applied {} tail changes of {} in {}", rows, self.table.key, range);
            }
            DecoderOutput::Heartbeat { .. } => {}
        }
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        if self.in_txn {
            self.rollback().await?;
        }
        Ok(())
    }
}

/// Keep the last row per primary key; one upsert statement cannot touch a row twice.
fn dedup_by_key<'a>(rows: Vec<Vec<&'a Value>>, pk_positions: &[usize]) -> Vec<Vec<&'a Value>> {
    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    let mut kept: Vec<Vec<&Value>> = rows
        .into_iter()
        .rev()
        .filter(|row| {
            let key: Vec<Value> = pk_positions.iter().map(|&p| row[p].clone()).collect();
            seen.insert(encode_key(&key))
        })
        .collect();
    kept.reverse();
    kept
}

/// Convert a value to a parameter of the column's declared type.
///
/// NULL binds as `None` of that type, so it needs no inference on the server.
fn bind_value(value: &Value, data_type: &str) -> Result<BoundValue> {
    let bound: BoundValue = match data_type {
        "smallint" | "int2" => Box::new(as_int(value)?.map(i16::try_from).transpose()?),
        "integer" | "int4" => Box::new(as_int(value)?.map(i32::try_from).transpose()?),
        "bigint" | "int8" => Box::new(as_int(value)?),
        "real" | "float4" => Box::new(as_float(value)?.map(|f| f as f32)),
        "double precision" | "float8" => Box::new(as_float(value)?),
        "boolean" | "bool" => Box::new(as_bool(value)?),
        "bytea" => Box::new(as_bytes(value)?),
        "timestamp with time zone" | "timestamptz" => Box::new(as_datetime(value)?),
        "timestamp without time zone" | "timestamp" => {
            Box::new(as_datetime(value)?.map(|dt| dt.naive_utc()))
        }
        "json" | "jsonb" => Box::new(as_json(value)?),
        "text" | "character varying" | "varchar" | "character" | "char" | "name" => {
            Box::new(as_text(value)?)
        }
        other => bail!("unsupported target column type {}", other),
    };
    Ok(bound)
}

fn as_int(value: &Value) -> Result<Option<i64>> {
    match value {
        Value::Null => Ok(None),
        Value::Int(i) => Ok(Some(*i)),
        Value::Bool(b) => Ok(Some(i64::from(*b))),
        Value::Timestamp(ts) => Ok(Some(ts.physical())),
        other => bail!("cannot store {} in an integer column", other.type_name()),
    }
}

fn as_float(value: &Value) -> Result<Option<f64>> {
    match value {
        Value::Null => Ok(None),
        Value::Float(f) => Ok(Some(*f)),
        Value::Int(i) => Ok(Some(*i as f64)),
        other => bail!("cannot store {} in a float column", other.type_name()),
    }
}

fn as_bool(value: &Value) -> Result<Option<bool>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        other => bail!("cannot store {} in a boolean column", other.type_name()),
    }
}

fn as_bytes(value: &Value) -> Result<Option<Vec<u8>>> {
    match value {
        Value::Null => Ok(None),
        Value::Bytes(b) => Ok(Some(b.clone())),
        Value::Text(s) => Ok(Some(s.as_bytes().to_vec())),
        other => bail!("cannot store {} in a bytea column", other.type_name()),
    }
}

/// Hybrid timestamps and integers are read as milliseconds since the epoch.
fn as_datetime(value: &Value) -> Result<Option<DateTime<Utc>>> {
    let millis = match value {
        Value::Null => return Ok(None),
        Value::Timestamp(ts) => ts.physical(),
        Value::Int(i) => *i,
        Value::Text(s) => {
            let parsed = DateTime::<FixedOffset>::parse_from_rfc3339(s)
                .with_context(|| format!("invalid RFC 3339 timestamp {:?}", s))?;
            return Ok(Some(parsed.with_timezone(&Utc)));
        }
        other => bail!("cannot store {} in a timestamp column", other.type_name()),
    };
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(Some)
        .ok_or_else(|| anyhow!("timestamp {}ms is out of range", millis))
}

fn as_json(value: &Value) -> Result<Option<serde_json::Value>> {
    let json = match value {
        Value::Null => return Ok(None),
        Value::Text(s) => serde_json::from_str(s).context("invalid JSON text")?,
        Value::Bool(b) => serde_json::Value::from(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Timestamp(ts) => serde_json::Value::from(ts.to_string()),
        Value::Bytes(_) => bail!("cannot store bytes in a JSON column"),
    };
    Ok(Some(json))
}

fn as_text(value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::Text(s) => Ok(Some(s.clone())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Int(i) => Ok(Some(i.to_string())),
        Value::Float(f) => Ok(Some(f.to_string())),
        Value::Timestamp(ts) => Ok(Some(ts.to_string())),
        Value::Bytes(_) => bail!("cannot store bytes in a text column"),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `($1, $2), ($3, $4), ...` for `num_rows` tuples of `width` parameters.
fn placeholder_tuples(num_rows: usize, width: usize) -> Vec<String> {
    (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..width)
                .map(|col_idx| format!("${}", row_idx * width + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect()
}

/// Build a multi-row upsert with `num_rows` placeholder tuples in `all_columns` order.
fn build_upsert_query(
    schema: &str,
    table: &str,
    primary_key_columns: &[String],
    all_columns: &[String],
    num_rows: usize,
) -> String {
    let quoted_columns: Vec<String> = all_columns.iter().map(|c| quote_ident(c)).collect();
    let quoted_pk_columns: Vec<String> = primary_key_columns.iter().map(|c| quote_ident(c)).collect();
    let value_rows = placeholder_tuples(num_rows, all_columns.len());

    let update_columns: Vec<String> = all_columns
        .iter()
        .filter(|c| !primary_key_columns.contains(c))
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let update_clause = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO {}.{} ({}) VALUES {} ON CONFLICT ({}) {}",
        quote_ident(schema),
        quote_ident(table),
        quoted_columns.join(", "),
        value_rows.join(", "),
        quoted_pk_columns.join(", "),
        update_clause
    )
}

/// Build a DELETE for `num_rows` primary-key tuples.
fn build_delete_query(
    schema: &str,
    table: &str,
    primary_key_columns: &[String],
    num_rows: usize,
) -> String {
    if primary_key_columns.len() == 1 {
        let placeholders: Vec<String> = (1..=num_rows).map(|i| format!("${}", i)).collect();
        format!(
            "DELETE FROM {}.{} WHERE {} IN ({})",
            quote_ident(schema),
            quote_ident(table),
            quote_ident(&primary_key_columns[0]),
            placeholders.join(", ")
        )
    } else {
        let pk_cols: Vec<String> = primary_key_columns.iter().map(|c| quote_ident(c)).collect();
        let tuples = placeholder_tuples(num_rows, primary_key_columns.len());
        format!(
            "DELETE FROM {}.{} WHERE ({}) IN ({})",
            quote_ident(schema),
            quote_ident(table),
            pk_cols.join(", "),
            tuples.join(", ")
        )
    }
}

/// Column names and `information_schema` data types of a target table, in ordinal order.
async fn get_table_columns(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<(String, String)>> {
    let rows = client
        .query(
            "SELECT column_name, data_type
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY ordinal_position",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("Failed to get columns for {}.{}", schema, table))?;

    if rows.is_empty() {
        bail!("Target table {}.{} does not exist", schema, table);
    }
    Ok(rows
        .iter()
        .map(|row| {
            let name: String = row.get(0);
            let dtype: String = row.get(1);
            (name, dtype)
        })
        .collect())
}
