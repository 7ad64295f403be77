pub mod statement;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use url::Url;

use crate::error::{Error, Result};
pub use statement::{Dialect, Predicate, SqlValue, Statement, StatementKind};

/// One result row, keyed by column name.
pub type Row = Map<String, Value>;

/// Outcome of a single gateway call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayResponse {
    /// Row count reported for a mutating statement; `None` when the server
    /// reports none.
    pub rows_affected: Option<u64>,
    pub rows: Vec<Row>,
}

/// Executes statements against the target store. Each call is independent;
/// there is no transaction spanning two calls.
#[async_trait]
pub trait DataGateway: Send + Sync {
    async fn execute(&self, statement: &Statement) -> Result<GatewayResponse>;
}

impl GatewayResponse {
    /// Decode a response body. Accepts the tool envelope
    /// `{"content": [{"text": "<json>"}]}` as well as a bare result object.
    pub fn from_body(body: &Value) -> Result<Self> {
        match body.get("content") {
            Some(content) => {
                let text = content
                    .as_array()
                    .and_then(|items| items.first())
                    .and_then(|item| item.get("text"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::GatewayProtocol("envelope without content text".to_string())
                    })?;
                let inner: Value = serde_json::from_str(text)?;
                Self::from_result(&inner)
            }
            None => Self::from_result(body),
        }
    }

    fn from_result(result: &Value) -> Result<Self> {
        let obj = result
            .as_object()
            .ok_or_else(|| Error::GatewayProtocol(format!("expected object, got {result}")))?;

        let error_text = obj.get("error").and_then(Value::as_str).filter(|e| !e.is_empty());
        match (obj.get("success").and_then(Value::as_bool), error_text) {
            (Some(false), e) => {
                return Err(Error::GatewayStatement(
                    e.unwrap_or("statement failed").to_string(),
                ));
            }
            (None, Some(e)) => return Err(Error::GatewayStatement(e.to_string())),
            _ => {}
        }

        let rows_value = ["results", "rows", "data"].iter().find_map(|k| obj.get(*k));
        let rows = match rows_value {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Object(row) => Ok(row.clone()),
                    other => Err(Error::GatewayProtocol(format!("row is not an object: {other}"))),
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(Error::GatewayProtocol(format!("rows is not an array: {other}")));
            }
        };

        let affected = ["rows_affected", "rowcount", "affected_rows"]
            .iter()
            .find_map(|k| obj.get(*k));
        let rows_affected = match affected {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_i64().map(|n| n.max(0) as u64).ok_or_else(|| {
                Error::GatewayProtocol(format!("rows_affected is not a number: {v}"))
            })?),
        };

        if rows_value.is_none() && affected.is_none() && !obj.contains_key("success") {
            return Err(Error::GatewayProtocol(format!(
                "unrecognised response: {result}"
            )));
        }

        Ok(Self {
            rows_affected,
            rows,
        })
    }
}

// ── HTTP gateway ───────────────────────────────────────────────────

/// Gateway speaking to the SQL tool server (`POST /tools/execute_sql`).
pub struct HttpGateway {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("tools/execute_sql")?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Request payload: `{"sql", "database", "params"}` with `@pN` names.
    pub fn payload(statement: &Statement) -> Result<Value> {
        let (sql, params) = statement.to_sql(Dialect::MsSql)?;
        let named: Map<String, Value> = params
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("p{}", i + 1), v.to_json()))
            .collect();
        Ok(serde_json::json!({
            "sql": sql,
            "database": statement.database,
            "params": named,
        }))
    }
}

#[async_trait]
impl DataGateway for HttpGateway {
    async fn execute(&self, statement: &Statement) -> Result<GatewayResponse> {
        let payload = Self::payload(statement)?;
        log::debug!(
            "{} {}: {}",
            statement.database,
            statement.kind,
            payload["sql"].as_str().unwrap_or_default()
        );

        let resp = self
            .client
            .post(self.endpoint.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::GatewayStatement(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::GatewayStatement(format!("http status {status}: {body}")));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::GatewayProtocol(format!("invalid response body: {e}")))?;
        GatewayResponse::from_body(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(inner: Value) -> Value {
        json!({ "content": [{ "type": "text", "text": inner.to_string() }] })
    }

    #[test]
    fn test_envelope_with_results() {
        let body = envelope(json!({
            "success": true,
            "results": [{ "UntersuchungID": 1, "Datum": "31.07.2025" }],
        }));
        let resp = GatewayResponse::from_body(&body).unwrap();
        assert_eq!(resp.rows.len(), 1);
        assert_eq!(resp.rows[0]["UntersuchungID"], json!(1));
        assert_eq!(resp.rows_affected, None);
    }

    #[test]
    fn test_bare_result_with_rowcount() {
        let body = json!({ "success": true, "rowcount": 3 });
        let resp = GatewayResponse::from_body(&body).unwrap();
        assert_eq!(resp.rows_affected, Some(3));

        let body = envelope(json!({ "success": true, "rows_affected": 0 }));
        assert_eq!(GatewayResponse::from_body(&body).unwrap().rows_affected, Some(0));
        assert!(resp.rows.is_empty());

        let body = json!({ "rows": [{ "PatientID": 5 }] });
        let resp = GatewayResponse::from_body(&body).unwrap();
        assert_eq!(resp.rows[0]["PatientID"], json!(5));
    }

    #[test]
    fn test_statement_failure() {
        let body = envelope(json!({ "success": false, "error": "Invalid column name 'Foo'" }));
        match GatewayResponse::from_body(&body) {
            Err(Error::GatewayStatement(msg)) => assert!(msg.contains("Invalid column")),
            other => panic!("expected statement error, got {other:?}"),
        }

        let body = json!({ "error": "deadlock victim" });
        assert!(matches!(
            GatewayResponse::from_body(&body),
            Err(Error::GatewayStatement(_))
        ));
    }

    #[test]
    fn test_malformed_envelopes() {
        let cases = [
            json!({ "content": [] }),
            json!({ "content": [{ "text": "not json" }] }),
            json!({ "content": [{ "text": "[1, 2]" }] }),
            json!({ "success": true, "results": "nope" }),
            json!({ "success": true, "results": [1] }),
            json!({ "hello": "world" }),
        ];
        for body in cases {
            assert!(
                matches!(GatewayResponse::from_body(&body), Err(Error::GatewayProtocol(_))),
                "expected protocol error for {body}"
            );
        }
    }

    #[test]
    fn test_http_payload_uses_named_params() {
        let stmt = Statement::delete("SQLHK", "Untersuchung")
            .filter(Predicate::is_in("Datum", ["31.07.2025", "2025-07-31"]));
        let payload = HttpGateway::payload(&stmt).unwrap();
        assert_eq!(payload["database"], json!("SQLHK"));
        assert_eq!(
            payload["sql"],
            json!("DELETE FROM [Untersuchung] WHERE [Datum] IN (@p1, @p2)")
        );
        assert_eq!(payload["params"]["p2"], json!("2025-07-31"));
    }

    #[test]
    fn test_http_gateway_endpoint() {
        let gw = HttpGateway::new("http://localhost:7007/", Duration::from_secs(5)).unwrap();
        assert_eq!(gw.endpoint().as_str(), "http://localhost:7007/tools/execute_sql");
        assert!(HttpGateway::new("not a url", Duration::from_secs(5)).is_err());
    }
}
