use std::fmt;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};

static RE_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Scalar function the SQLite store registers to read a stored date as its
/// ISO calendar date, or NULL when the text is not a date.
pub const SQLITE_DATE_FN: &str = "calldoc_date";

/// SQL Server conversion styles tried on stored dates: `dd.mm.yyyy`,
/// `yyyy-mm-dd`, `yyyy-mm-dd hh:mi:ss`, `yyyy-mm-ddThh:mi:ss`.
const MSSQL_DATE_STYLES: [u32; 4] = [104, 23, 120, 126];

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl SqlValue {
    pub fn to_json(&self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Int(i) => Value::from(*i),
            SqlValue::Real(f) => Value::from(*f),
            SqlValue::Text(s) => Value::from(s.as_str()),
            // The examination table stores flags as bit/integer columns.
            SqlValue::Bool(b) => Value::from(i64::from(*b)),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatementKind::Select => "select",
            StatementKind::Insert => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Row filter of a SELECT, UPDATE or DELETE.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    Eq(String, SqlValue),
    In(String, Vec<SqlValue>),
    IsNotNull(String),
    /// Column holds this calendar date, whatever text or type it is stored as.
    OnDate(String, NaiveDate),
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(column: &str, value: impl Into<SqlValue>) -> Self {
        Predicate::Eq(column.to_string(), value.into())
    }

    pub fn is_in<V: Into<SqlValue>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Predicate::In(column.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn is_not_null(column: &str) -> Self {
        Predicate::IsNotNull(column.to_string())
    }

    pub fn on_date(column: &str, date: NaiveDate) -> Self {
        Predicate::OnDate(column.to_string(), date)
    }
}

/// SQL flavour a statement is rendered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `[Ident]` quoting, `@pN` named parameters.
    MsSql,
    /// `"ident"` quoting, `?N` positional parameters.
    Sqlite,
}

impl Dialect {
    fn quote(&self, ident: &str) -> Result<String> {
        if !RE_IDENT.is_match(ident) {
            return Err(Error::GatewayStatement(format!("invalid identifier: {ident:?}")));
        }
        Ok(match self {
            Dialect::MsSql => format!("[{ident}]"),
            Dialect::Sqlite => format!("\"{ident}\""),
        })
    }

    /// Expression comparing `column` with the ISO date bound at `holder`.
    fn date_equals(&self, column: &str, holder: &str) -> String {
        match self {
            Dialect::MsSql => {
                let tries: Vec<String> = MSSQL_DATE_STYLES
                    .iter()
                    .map(|style| format!("TRY_CONVERT(DATE, {column}, {style})"))
                    .collect();
                format!(
                    "COALESCE({}) = TRY_CONVERT(DATE, {holder}, 23)",
                    tries.join(", ")
                )
            }
            Dialect::Sqlite => format!("{SQLITE_DATE_FN}({column}) = {holder}"),
        }
    }

    fn placeholder(&self, idx: usize) -> String {
        match self {
            Dialect::MsSql => format!("@p{idx}"),
            Dialect::Sqlite => format!("?{idx}"),
        }
    }
}

/// One statement addressed to a logical database on the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub database: String,
    pub kind: StatementKind,
    pub table: String,
    /// Projected columns of a SELECT; empty selects every column.
    pub columns: Vec<String>,
    /// Column assignments of an INSERT or UPDATE.
    pub values: Vec<(String, SqlValue)>,
    pub predicate: Predicate,
    pub order_by: Option<String>,
}

impl Statement {
    fn new(kind: StatementKind, database: &str, table: &str) -> Self {
        Self {
            database: database.to_string(),
            kind,
            table: table.to_string(),
            columns: Vec::new(),
            values: Vec::new(),
            predicate: Predicate::All,
            order_by: None,
        }
    }

    pub fn select(database: &str, table: &str) -> Self {
        Self::new(StatementKind::Select, database, table)
    }

    pub fn insert(database: &str, table: &str, values: Vec<(String, SqlValue)>) -> Self {
        let mut stmt = Self::new(StatementKind::Insert, database, table);
        stmt.values = values;
        stmt
    }

    pub fn update(database: &str, table: &str, values: Vec<(String, SqlValue)>) -> Self {
        let mut stmt = Self::new(StatementKind::Update, database, table);
        stmt.values = values;
        stmt
    }

    pub fn delete(database: &str, table: &str) -> Self {
        Self::new(StatementKind::Delete, database, table)
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.order_by = Some(column.to_string());
        self
    }

    /// Render into SQL text and the parameters bound to its placeholders, in
    /// placeholder order (first value binds to index 1).
    pub fn to_sql(&self, dialect: Dialect) -> Result<(String, Vec<SqlValue>)> {
        let mut params: Vec<SqlValue> = Vec::new();
        let table = dialect.quote(&self.table)?;

        let mut sql = match self.kind {
            StatementKind::Select => {
                let cols = if self.columns.is_empty() {
                    "*".to_string()
                } else {
                    self.columns
                        .iter()
                        .map(|c| dialect.quote(c))
                        .collect::<Result<Vec<_>>>()?
                        .join(", ")
                };
                format!("SELECT {cols} FROM {table}")
            }
            StatementKind::Insert => {
                if self.values.is_empty() {
                    return Err(Error::GatewayStatement(format!(
                        "insert into {} without values",
                        self.table
                    )));
                }
                let mut cols = Vec::with_capacity(self.values.len());
                let mut holders = Vec::with_capacity(self.values.len());
                for (col, val) in &self.values {
                    cols.push(dialect.quote(col)?);
                    params.push(val.clone());
                    holders.push(dialect.placeholder(params.len()));
                }
                format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    cols.join(", "),
                    holders.join(", ")
                )
            }
            StatementKind::Update => {
                if self.values.is_empty() {
                    return Err(Error::GatewayStatement(format!(
                        "update of {} without assignments",
                        self.table
                    )));
                }
                let mut sets = Vec::with_capacity(self.values.len());
                for (col, val) in &self.values {
                    params.push(val.clone());
                    sets.push(format!(
                        "{} = {}",
                        dialect.quote(col)?,
                        dialect.placeholder(params.len())
                    ));
                }
                format!("UPDATE {table} SET {}", sets.join(", "))
            }
            StatementKind::Delete => format!("DELETE FROM {table}"),
        };

        if self.kind != StatementKind::Insert {
            // Unbounded mutations would reach rows of other dates.
            if self.predicate == Predicate::All && self.kind != StatementKind::Select {
                return Err(Error::GatewayStatement(format!(
                    "refusing unbounded {} on {}",
                    self.kind, self.table
                )));
            }
            if let Some(clause) = render_predicate(&self.predicate, dialect, &mut params)? {
                sql.push_str(" WHERE ");
                sql.push_str(&clause);
            }
        }

        if let (StatementKind::Select, Some(col)) = (self.kind, &self.order_by) {
            sql.push_str(&format!(" ORDER BY {}", dialect.quote(col)?));
        }

        Ok((sql, params))
    }
}

fn render_predicate(
    predicate: &Predicate,
    dialect: Dialect,
    params: &mut Vec<SqlValue>,
) -> Result<Option<String>> {
    let clause = match predicate {
        Predicate::All => return Ok(None),
        Predicate::Eq(col, SqlValue::Null) => format!("{} IS NULL", dialect.quote(col)?),
        Predicate::Eq(col, val) => {
            params.push(val.clone());
            format!("{} = {}", dialect.quote(col)?, dialect.placeholder(params.len()))
        }
        Predicate::In(_, vals) if vals.is_empty() => "1 = 0".to_string(),
        Predicate::In(col, vals) => {
            let mut holders = Vec::with_capacity(vals.len());
            for val in vals {
                params.push(val.clone());
                holders.push(dialect.placeholder(params.len()));
            }
            format!("{} IN ({})", dialect.quote(col)?, holders.join(", "))
        }
        Predicate::IsNotNull(col) => format!("{} IS NOT NULL", dialect.quote(col)?),
        Predicate::OnDate(col, date) => {
            params.push(SqlValue::Text(date.format("%Y-%m-%d").to_string()));
            dialect.date_equals(&dialect.quote(col)?, &dialect.placeholder(params.len()))
        }
        Predicate::And(parts) => {
            let mut rendered = Vec::new();
            for part in parts {
                if let Some(c) = render_predicate(part, dialect, params)? {
                    rendered.push(format!("({c})"));
                }
            }
            if rendered.is_empty() {
                return Ok(None);
            }
            rendered.join(" AND ")
        }
    };
    Ok(Some(clause))
}
