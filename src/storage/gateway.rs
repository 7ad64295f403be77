use async_trait::async_trait;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::gateway::{DataGateway, Dialect, GatewayResponse, SqlValue, Statement, StatementKind};
use crate::storage::Database;

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::from(rusqlite::types::Null),
            SqlValue::Int(i) => ToSqlOutput::from(*i),
            SqlValue::Real(f) => ToSqlOutput::from(*f),
            SqlValue::Text(s) => ToSqlOutput::from(s.as_str()),
            SqlValue::Bool(b) => ToSqlOutput::from(i64::from(*b)),
        })
    }
}

/// Gateway executing statements against a local SQLite copy of the target
/// tables. Statements addressed to another logical database are rejected.
#[derive(Clone)]
pub struct SqliteGateway {
    db: Database,
    database: String,
}

impl SqliteGateway {
    pub fn new(db: Database, database: &str) -> Self {
        Self {
            db,
            database: database.to_string(),
        }
    }

    pub async fn open(path: &str, database: &str) -> Result<Self> {
        let db = Database::open_at(path).await?;
        Ok(Self::new(db, database))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }
}

fn value_to_json(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

#[async_trait]
impl DataGateway for SqliteGateway {
    async fn execute(&self, statement: &Statement) -> Result<GatewayResponse> {
        if statement.database != self.database {
            return Err(Error::GatewayStatement(format!(
                "statement addressed to {}, gateway serves {}",
                statement.database, self.database
            )));
        }
        let (sql, params) = statement.to_sql(Dialect::Sqlite)?;
        log::debug!("{} {}: {sql}", statement.database, statement.kind);

        let kind = statement.kind;
        self.db
            .writer()
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let bound = rusqlite::params_from_iter(params.iter());
                if kind != StatementKind::Select {
                    let affected = stmt.execute(bound)?;
                    return Ok::<_, rusqlite::Error>(GatewayResponse {
                        rows_affected: Some(affected as u64),
                        rows: Vec::new(),
                    });
                }

                let names: Vec<String> =
                    stmt.column_names().into_iter().map(String::from).collect();
                let mut rows = stmt.query(bound)?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let mut map = Map::new();
                    for (i, name) in names.iter().enumerate() {
                        map.insert(name.clone(), value_to_json(row.get_ref(i)?));
                    }
                    out.push(map);
                }
                Ok(GatewayResponse {
                    rows_affected: None,
                    rows: out,
                })
            })
            .await
            .map_err(|e| Error::GatewayStatement(e.to_string()))
    }
}
