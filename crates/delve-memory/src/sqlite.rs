use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::TableStoreError;
use crate::table::{
    BoxFuture, ColumnType, NearestQuery, Predicate, Row, ScoredRow, TableSchema, TableStore,
    Value, check_columns, check_indexable, check_update, rank,
};

type RawRow = (String, String, Option<Vec<u8>>);

/// [`TableStore`] persisted in a single `SQLite` database.
///
/// Logical tables share one physical row table; each row keeps its scalar
/// columns as a JSON object and its vector as a little-endian `f32` blob.
#[derive(Debug, Clone)]
pub struct SqliteTableStore {
    pool: SqlitePool,
}

impl SqliteTableStore {
    /// Open (or create) the `SQLite` database and run migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub async fn new(path: &str) -> Result<Self, TableStoreError> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // every in-memory connection is its own database
        let pool_opts = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_opts.connect_with(opts).await?;

        sqlx::migrate!("../../migrations").run(&pool).await?;
        tracing::debug!(path, "sqlite table store ready");

        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn schema_of(&self, table: &str) -> Result<TableSchema, TableStoreError> {
        let raw: Option<(String,)> = sqlx::query_as("SELECT schema FROM delve_tables WHERE name = ?")
            .bind(table)
            .fetch_optional(&self.pool)
            .await?;
        let (json,) = raw.ok_or_else(|| TableStoreError::TableNotFound(table.to_owned()))?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn fetch_matching(
        &self,
        table: &str,
        schema: &TableSchema,
        filter: &Predicate,
    ) -> Result<Vec<Row>, TableStoreError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT row_key, fields, vector FROM delve_rows WHERE table_name = ");
        qb.push_bind(table.to_owned());
        push_filter(&mut qb, schema, filter);
        qb.push(" ORDER BY row_key");

        let raw: Vec<RawRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut rows = Vec::with_capacity(raw.len());
        for (_, fields, vector) in raw {
            let row = decode_row(schema, &fields, vector)?;
            if filter.matches(&row) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn write_rows(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: &[(String, Row)],
    ) -> Result<(), TableStoreError> {
        let mut tx = self.pool.begin().await?;
        for (key, row) in rows {
            let (fields, vector) = encode_row(schema, row)?;
            sqlx::query(
                "INSERT INTO delve_rows (table_name, row_key, fields, vector) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(table_name, row_key) DO UPDATE SET \
                 fields = excluded.fields, vector = excluded.vector",
            )
            .bind(table)
            .bind(key)
            .bind(fields)
            .bind(vector)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn json_path(column: &str) -> String {
    format!("json_extract(fields, '$.{column}')")
}

/// Narrow the SQL scan with the parts of `filter` that translate directly.
/// The full predicate is still evaluated on every returned row.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, schema: &TableSchema, filter: &Predicate) {
    match filter {
        Predicate::All => {}
        Predicate::And(parts) => {
            for p in parts {
                push_filter(qb, schema, p);
            }
        }
        Predicate::Eq(col, value) => {
            let Some(target) = scalar_target(schema, col) else {
                return;
            };
            match value {
                Value::Text(s) => {
                    qb.push(format!(" AND {target} = "));
                    qb.push_bind(s.clone());
                }
                Value::Integer(i) => {
                    qb.push(format!(" AND {target} = "));
                    qb.push_bind(*i);
                }
                _ => {}
            }
        }
        Predicate::Like(col, pattern) => {
            if let Some(target) = scalar_target(schema, col) {
                qb.push(format!(" AND {target} LIKE "));
                qb.push_bind(pattern.clone());
                qb.push(" ESCAPE '\\'");
            }
        }
        Predicate::In(col, values) => {
            let texts: Vec<String> = values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect();
            if texts.len() != values.len() {
                return;
            }
            if texts.is_empty() {
                qb.push(" AND 0");
                return;
            }
            match schema.column_type(col) {
                Some(ColumnType::TextList) => {
                    qb.push(format!(
                        " AND EXISTS (SELECT 1 FROM json_each(fields, '$.{col}') WHERE value IN ("
                    ));
                }
                Some(ColumnType::Text) => {
                    let Some(target) = scalar_target(schema, col) else {
                        return;
                    };
                    qb.push(format!(" AND {target} IN ("));
                }
                _ => return,
            }
            {
                let mut sep = qb.separated(", ");
                for t in texts {
                    sep.push_bind(t);
                }
            }
            qb.push(")");
            if schema.column_type(col) == Some(ColumnType::TextList) {
                qb.push(")");
            }
        }
    }
}

fn scalar_target(schema: &TableSchema, column: &str) -> Option<String> {
    if column == schema.key {
        return Some("row_key".to_owned());
    }
    match schema.column_type(column)? {
        ColumnType::Text | ColumnType::Integer => Some(json_path(column)),
        _ => None,
    }
}

fn encode_row(schema: &TableSchema, row: &Row) -> Result<(String, Option<Vec<u8>>), TableStoreError> {
    let vector_column = schema.vector_column();
    let mut fields = row.clone();
    let vector = vector_column
        .and_then(|c| fields.remove(c))
        .and_then(|v| v.as_vector().map(encode_vector));
    Ok((serde_json::to_string(&fields)?, vector))
}

fn decode_row(
    schema: &TableSchema,
    fields: &str,
    vector: Option<Vec<u8>>,
) -> Result<Row, TableStoreError> {
    let mut row: Row = serde_json::from_str(fields)?;
    if let (Some(column), Some(bytes)) = (schema.vector_column(), vector) {
        row.insert(column.to_owned(), Value::Vector(decode_vector(&bytes)));
    }
    Ok(row)
}

#[must_use]
pub fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

#[must_use]
pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl TableStore for SqliteTableStore {
    fn list_tables(&self) -> BoxFuture<'_, Result<Vec<String>, TableStoreError>> {
        Box::pin(async move {
            let names: Vec<(String,)> = sqlx::query_as("SELECT name FROM delve_tables ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
            Ok(names.into_iter().map(|(n,)| n).collect())
        })
    }

    fn table_exists(&self, table: &str) -> BoxFuture<'_, Result<bool, TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            let (exists,): (bool,) =
                sqlx::query_as("SELECT EXISTS(SELECT 1 FROM delve_tables WHERE name = ?)")
                    .bind(&table)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(exists)
        })
    }

    fn ensure_table(
        &self,
        table: &str,
        schema: TableSchema,
    ) -> BoxFuture<'_, Result<(), TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            schema.validate()?;
            let json = serde_json::to_string(&schema)?;
            sqlx::query("INSERT INTO delve_tables (name, schema) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
                .bind(&table)
                .bind(&json)
                .execute(&self.pool)
                .await?;
            let existing = self.schema_of(&table).await?;
            if existing != schema {
                return Err(TableStoreError::Schema(format!(
                    "table {table} exists with a different schema"
                )));
            }
            Ok(())
        })
    }

    fn drop_table(&self, table: &str) -> BoxFuture<'_, Result<(), TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM delve_rows WHERE table_name = ?")
                .bind(&table)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM delve_tables WHERE name = ?")
                .bind(&table)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    fn scan(
        &self,
        table: &str,
        filter: Predicate,
        limit: Option<usize>,
    ) -> BoxFuture<'_, Result<Vec<Row>, TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            let schema = self.schema_of(&table).await?;
            check_columns(&schema, &filter)?;
            let mut rows = self.fetch_matching(&table, &schema, &filter).await?;
            if let Some(limit) = limit {
                rows.truncate(limit);
            }
            Ok(rows)
        })
    }

    fn nearest(
        &self,
        table: &str,
        query: NearestQuery,
    ) -> BoxFuture<'_, Result<Vec<ScoredRow>, TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            let schema = self.schema_of(&table).await?;
            check_columns(&schema, &query.filter)?;
            let Some(vector_column) = schema.vector_column() else {
                return Err(TableStoreError::Schema(format!(
                    "table {table} has no vector column"
                )));
            };
            let rows = self.fetch_matching(&table, &schema, &query.filter).await?;
            Ok(rank(rows.iter(), vector_column, &query))
        })
    }

    fn merge_insert(
        &self,
        table: &str,
        rows: Vec<Row>,
    ) -> BoxFuture<'_, Result<usize, TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            let schema = self.schema_of(&table).await?;
            let keyed = rows
                .into_iter()
                .map(|row| schema.check_row(&row).map(|key| (key, row)))
                .collect::<Result<Vec<_>, _>>()?;
            self.write_rows(&table, &schema, &keyed).await?;
            Ok(keyed.len())
        })
    }

    fn update(
        &self,
        table: &str,
        filter: Predicate,
        column: &str,
        value: Value,
    ) -> BoxFuture<'_, Result<usize, TableStoreError>> {
        let table = table.to_owned();
        let column = column.to_owned();
        Box::pin(async move {
            let schema = self.schema_of(&table).await?;
            check_columns(&schema, &filter)?;
            check_update(&schema, &column, &value)?;
            let rows = self.fetch_matching(&table, &schema, &filter).await?;
            let keyed: Vec<(String, Row)> = rows
                .into_iter()
                .filter_map(|mut row| {
                    let key = row.get(&schema.key)?.as_str()?.to_owned();
                    row.insert(column.clone(), value.clone());
                    Some((key, row))
                })
                .collect();
            self.write_rows(&table, &schema, &keyed).await?;
            Ok(keyed.len())
        })
    }

    fn delete(
        &self,
        table: &str,
        filter: Predicate,
    ) -> BoxFuture<'_, Result<usize, TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            let schema = self.schema_of(&table).await?;
            check_columns(&schema, &filter)?;
            let rows = self.fetch_matching(&table, &schema, &filter).await?;
            let mut tx = self.pool.begin().await?;
            let mut deleted = 0;
            for row in &rows {
                let Some(key) = row.get(&schema.key).and_then(Value::as_str) else {
                    continue;
                };
                let res = sqlx::query("DELETE FROM delve_rows WHERE table_name = ? AND row_key = ?")
                    .bind(&table)
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
                if res.rows_affected() > 0 {
                    deleted += 1;
                }
            }
            tx.commit().await?;
            Ok(deleted)
        })
    }

    fn count_rows(&self, table: &str) -> BoxFuture<'_, Result<usize, TableStoreError>> {
        let table = table.to_owned();
        Box::pin(async move {
            self.schema_of(&table).await?;
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM delve_rows WHERE table_name = ?")
                    .bind(&table)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }

    fn create_index(
        &self,
        table: &str,
        column: &str,
    ) -> BoxFuture<'_, Result<(), TableStoreError>> {
        let table = table.to_owned();
        let column = column.to_owned();
        Box::pin(async move {
            let schema = self.schema_of(&table).await?;
            check_indexable(&schema, &column)?;
            sqlx::query(
                "INSERT INTO delve_indexes (table_name, column_name) VALUES (?, ?) \
                 ON CONFLICT(table_name, column_name) DO NOTHING",
            )
            .bind(&table)
            .bind(&column)
            .execute(&self.pool)
            .await?;
            // the key column is covered by the primary key; list columns are matched via json_each
            if column != schema.key && schema.column_type(&column) == Some(ColumnType::Text) {
                let ddl = format!(
                    "CREATE INDEX IF NOT EXISTS delve_rows_{column} ON delve_rows(table_name, {})",
                    json_path(&column)
                );
                sqlx::query(&ddl).execute(&self.pool).await?;
            }
            Ok(())
        })
    }
}
