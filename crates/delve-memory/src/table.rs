//! Storage contract shared by every table backend.
//!
//! A table is a set of rows addressed by a text key column. Rows are flat
//! maps of typed values; at most one column holds an embedding vector that
//! [`TableStore::nearest`] ranks against.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::TableStoreError;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Integer(i64),
    TextList(Vec<String>),
    Vector(Vec<f32>),
}

impl Value {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::TextList(l) => Some(l),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Self::Vector(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Text(_) => ColumnType::Text,
            Self::Integer(_) => ColumnType::Integer,
            Self::TextList(_) => ColumnType::TextList,
            Self::Vector(_) => ColumnType::Vector,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<Vec<String>> for Value {
    fn from(l: Vec<String>) -> Self {
        Self::TextList(l)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Self::Vector(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    TextList,
    Vector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

/// Explicit table schema. The key column must be of type [`ColumnType::Text`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub key: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            columns: Vec::new(),
        }
    }

    #[must_use]
    pub fn column(mut self, name: &str, ty: ColumnType) -> Self {
        self.columns.push(Column {
            name: name.to_owned(),
            ty,
        });
        self
    }

    #[must_use]
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns.iter().find(|c| c.name == name).map(|c| c.ty)
    }

    #[must_use]
    pub fn vector_column(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.ty == ColumnType::Vector)
            .map(|c| c.name.as_str())
    }

    /// Check that column names are plain identifiers, unique, that the key
    /// column is text and that at most one vector column exists.
    ///
    /// # Errors
    ///
    /// Returns [`TableStoreError::Schema`] describing the first violation.
    pub fn validate(&self) -> Result<(), TableStoreError> {
        let mut seen = HashSet::new();
        for col in &self.columns {
            if !is_identifier(&col.name) {
                return Err(TableStoreError::Schema(format!(
                    "invalid column name {:?}",
                    col.name
                )));
            }
            if !seen.insert(col.name.as_str()) {
                return Err(TableStoreError::Schema(format!(
                    "duplicate column {}",
                    col.name
                )));
            }
        }
        if self.column_type(&self.key) != Some(ColumnType::Text) {
            return Err(TableStoreError::Schema(format!(
                "key column {} must be a text column",
                self.key
            )));
        }
        let vectors = self
            .columns
            .iter()
            .filter(|c| c.ty == ColumnType::Vector)
            .count();
        if vectors > 1 {
            return Err(TableStoreError::Schema(
                "at most one vector column is supported".into(),
            ));
        }
        Ok(())
    }

    /// Validate a row against the schema and return its key.
    ///
    /// # Errors
    ///
    /// Returns [`TableStoreError::Schema`] if a column is missing, has the wrong
    /// type, is unknown, or a vector is empty.
    pub fn check_row(&self, row: &Row) -> Result<String, TableStoreError> {
        for col in &self.columns {
            let Some(value) = row.get(&col.name) else {
                return Err(TableStoreError::Schema(format!("missing column {}", col.name)));
            };
            if value.column_type() != col.ty {
                return Err(TableStoreError::Schema(format!(
                    "column {} expects {:?}, got {:?}",
                    col.name,
                    col.ty,
                    value.column_type()
                )));
            }
            if let Value::Vector(v) = value
                && v.is_empty()
            {
                return Err(TableStoreError::Schema(format!("column {} is empty", col.name)));
            }
        }
        if let Some(extra) = row.keys().find(|k| self.column_type(k).is_none()) {
            return Err(TableStoreError::Schema(format!("unknown column {extra}")));
        }
        row.get(&self.key)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| TableStoreError::Schema(format!("missing key {}", self.key)))
    }

    /// # Errors
    ///
    /// Returns [`TableStoreError::Schema`] if the column is not part of the schema.
    pub fn require(&self, column: &str) -> Result<ColumnType, TableStoreError> {
        self.column_type(column)
            .ok_or_else(|| TableStoreError::Schema(format!("unknown column {column}")))
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Row filter. `In` against a list column matches when any element is in the set.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    Eq(String, Value),
    /// SQL-style pattern: `%` any run, `_` one character, `\` escapes.
    Like(String, String),
    In(String, Vec<Value>),
    And(Vec<Predicate>),
}

impl Predicate {
    #[must_use]
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::Eq(column.to_owned(), value.into())
    }

    #[must_use]
    pub fn like(column: &str, pattern: impl Into<String>) -> Self {
        Self::Like(column.to_owned(), pattern.into())
    }

    #[must_use]
    pub fn any_of<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::In(column.to_owned(), values.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Self::All, p) | (p, Self::All) => p,
            (Self::And(mut a), Self::And(b)) => {
                a.extend(b);
                Self::And(a)
            }
            (Self::And(mut a), p) => {
                a.push(p);
                Self::And(a)
            }
            (p, q) => Self::And(vec![p, q]),
        }
    }

    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::All => true,
            Self::Eq(col, expected) => row.get(col) == Some(expected),
            Self::Like(col, pattern) => row
                .get(col)
                .and_then(Value::as_str)
                .is_some_and(|s| like_match(pattern, s)),
            Self::In(col, values) => match row.get(col) {
                Some(Value::TextList(items)) => items
                    .iter()
                    .any(|item| values.iter().any(|v| v.as_str() == Some(item.as_str()))),
                Some(value) => values.contains(value),
                None => false,
            },
            Self::And(parts) => parts.iter().all(|p| p.matches(row)),
        }
    }

    /// Every column the predicate refers to.
    pub(crate) fn columns(&self) -> Vec<&str> {
        match self {
            Self::All => Vec::new(),
            Self::Eq(c, _) | Self::Like(c, _) | Self::In(c, _) => vec![c.as_str()],
            Self::And(parts) => parts.iter().flat_map(Predicate::columns).collect(),
        }
    }
}

/// Escape `%`, `_` and `\` so `s` matches literally inside a LIKE pattern.
#[must_use]
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

enum Token {
    AnyRun,
    AnyOne,
    Lit(char),
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '%' => Token::AnyRun,
            '_' => Token::AnyOne,
            '\\' => Token::Lit(chars.next().unwrap_or('\\')),
            c => Token::Lit(c),
        });
    }
    tokens
}

/// Case-sensitive LIKE matching with single-star backtracking.
#[must_use]
pub fn like_match(pattern: &str, text: &str) -> bool {
    let tokens = tokenize(pattern);
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match tokens.get(p) {
            Some(Token::AnyRun) => {
                star = Some((p, t));
                p += 1;
            }
            Some(Token::AnyOne) => {
                p += 1;
                t += 1;
            }
            Some(Token::Lit(c)) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => {
                let Some((sp, st)) = star else {
                    return false;
                };
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
        }
    }
    tokens[p..].iter().all(|tok| matches!(tok, Token::AnyRun))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    L2,
    Dot,
}

impl Metric {
    /// Distance between two vectors; smaller is closer. `None` on a dimension mismatch.
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> Option<f32> {
        if a.len() != b.len() || a.is_empty() {
            return None;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        Some(match self {
            Self::Cosine => {
                let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    1.0
                } else {
                    1.0 - dot / (norm_a * norm_b)
                }
            }
            Self::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
            Self::Dot => 1.0 - dot,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NearestQuery {
    pub vector: Vec<f32>,
    pub metric: Metric,
    pub limit: usize,
    pub filter: Predicate,
}

#[derive(Debug, Clone)]
pub struct ScoredRow {
    pub row: Row,
    pub distance: f32,
}

/// Rank already-filtered rows by distance to the query vector, ascending.
pub(crate) fn rank<'a>(
    rows: impl Iterator<Item = &'a Row>,
    vector_column: &str,
    query: &NearestQuery,
) -> Vec<ScoredRow> {
    let mut scored: Vec<ScoredRow> = rows
        .filter_map(|row| {
            let v = row.get(vector_column)?.as_vector()?;
            let distance = query.metric.distance(&query.vector, v)?;
            Some(ScoredRow {
                row: row.clone(),
                distance,
            })
        })
        .collect();
    scored.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    scored.truncate(query.limit);
    scored
}

/// Table storage engine consumed by the index.
///
/// Modeled on an embedded vector-table database: tables with explicit
/// schemas, predicate scans, nearest-neighbor search and keyed merge-insert.
pub trait TableStore: Send + Sync {
    fn list_tables(&self) -> BoxFuture<'_, Result<Vec<String>, TableStoreError>>;

    fn table_exists(&self, table: &str) -> BoxFuture<'_, Result<bool, TableStoreError>>;

    /// Create the table if missing. Fails if it exists with a different schema.
    fn ensure_table(
        &self,
        table: &str,
        schema: TableSchema,
    ) -> BoxFuture<'_, Result<(), TableStoreError>>;

    /// Drop the table and its rows. Dropping a missing table is not an error.
    fn drop_table(&self, table: &str) -> BoxFuture<'_, Result<(), TableStoreError>>;

    /// Rows matching `filter`, ordered by key.
    fn scan(
        &self,
        table: &str,
        filter: Predicate,
        limit: Option<usize>,
    ) -> BoxFuture<'_, Result<Vec<Row>, TableStoreError>>;

    fn nearest(
        &self,
        table: &str,
        query: NearestQuery,
    ) -> BoxFuture<'_, Result<Vec<ScoredRow>, TableStoreError>>;

    /// Update rows whose key matches, insert the rest. Returns rows written.
    fn merge_insert(
        &self,
        table: &str,
        rows: Vec<Row>,
    ) -> BoxFuture<'_, Result<usize, TableStoreError>>;

    /// Set `column` to `value` on every matching row. Returns rows updated.
    fn update(
        &self,
        table: &str,
        filter: Predicate,
        column: &str,
        value: Value,
    ) -> BoxFuture<'_, Result<usize, TableStoreError>>;

    fn delete(
        &self,
        table: &str,
        filter: Predicate,
    ) -> BoxFuture<'_, Result<usize, TableStoreError>>;

    fn count_rows(&self, table: &str) -> BoxFuture<'_, Result<usize, TableStoreError>>;

    /// Create a secondary index on a text or text-list column. Idempotent.
    fn create_index(&self, table: &str, column: &str)
    -> BoxFuture<'_, Result<(), TableStoreError>>;
}

/// Check the columns a predicate or update touches before running it.
pub(crate) fn check_columns(schema: &TableSchema, filter: &Predicate) -> Result<(), TableStoreError> {
    for col in filter.columns() {
        schema.require(col)?;
    }
    Ok(())
}

pub(crate) fn check_update(
    schema: &TableSchema,
    column: &str,
    value: &Value,
) -> Result<(), TableStoreError> {
    if column == schema.key {
        return Err(TableStoreError::Schema("key column cannot be updated".into()));
    }
    let ty = schema.require(column)?;
    if ty != value.column_type() {
        return Err(TableStoreError::Schema(format!(
            "column {column} expects {ty:?}, got {:?}",
            value.column_type()
        )));
    }
    Ok(())
}

pub(crate) fn check_indexable(schema: &TableSchema, column: &str) -> Result<(), TableStoreError> {
    match schema.require(column)? {
        ColumnType::Text | ColumnType::TextList => Ok(()),
        ty => Err(TableStoreError::Schema(format!(
            "column {column} of type {ty:?} cannot be indexed"
        ))),
    }
}
