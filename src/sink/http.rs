//! Blocking HTTP implementation of [`SinkClient`] for Elasticsearch.

use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{Result, RiverError};

use super::{BulkAction, BulkItemFailure, BulkSummary, SinkClient};

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

pub struct EsClient {
    http: HttpClient,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl EsClient {
    pub fn new(base_url: &str, credentials: Option<(&str, &str)>) -> Result<EsClient> {
        let http = HttpClient::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(EsClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: credentials.map(|(user, _)| user.to_string()),
            password: credentials.map(|(_, password)| password.to_string()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    fn fail(status: StatusCode, body: &Value) -> RiverError {
        let reason = body
            .pointer("/error/reason")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        RiverError::Sink {
            status: status.as_u16(),
            reason,
        }
    }

    fn error_type(body: &Value) -> &str {
        body.pointer("/error/type")
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

fn action_meta(
    kind: &str,
    index: &str,
    doc_type: &str,
    id: &str,
    routing: &Option<String>,
    parent: &Option<String>,
) -> Value {
    let mut meta = Map::new();
    meta.insert("_index".to_string(), json!(index));
    meta.insert("_type".to_string(), json!(doc_type));
    meta.insert("_id".to_string(), json!(id));
    if let Some(routing) = routing {
        meta.insert("_routing".to_string(), json!(routing));
    }
    if let Some(parent) = parent {
        meta.insert("_parent".to_string(), json!(parent));
    }
    json!({ (kind): Value::Object(meta) })
}

/// Render bulk actions as the newline delimited `_bulk` request body.
fn bulk_body(actions: &[BulkAction]) -> String {
    let mut body = String::new();
    for action in actions {
        match action {
            BulkAction::Index {
                index,
                doc_type,
                id,
                routing,
                parent,
                source,
            } => {
                body.push_str(
                    &action_meta("index", index, doc_type, id, routing, parent).to_string(),
                );
                body.push('\n');
                body.push_str(&source.to_string());
                body.push('\n');
            }
            BulkAction::Delete {
                index,
                doc_type,
                id,
                routing,
                parent,
            } => {
                body.push_str(
                    &action_meta("delete", index, doc_type, id, routing, parent).to_string(),
                );
                body.push('\n');
            }
        }
    }
    body
}

impl SinkClient for EsClient {
    fn create_index(&self, index: &str) -> Result<()> {
        let response = self.authorize(self.http.put(self.url(index)).json(&json!({}))).send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body: Value = response.json().unwrap_or(Value::Null);
        let error_type = Self::error_type(&body);
        if error_type.contains("already_exists") {
            debug!(index, "index already exists");
            return Ok(());
        }
        if status == StatusCode::SERVICE_UNAVAILABLE || error_type.contains("cluster_block") {
            return Err(RiverError::ClusterNotReady);
        }
        Err(Self::fail(status, &body))
    }

    fn put_mapping(&self, index: &str, doc_type: &str, mapping: &Value) -> Result<()> {
        let url = self.url(&format!("{}/_mapping/{}", index, doc_type));
        let response = self.authorize(self.http.put(url).json(mapping)).send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body: Value = response.json().unwrap_or(Value::Null);
        Err(Self::fail(status, &body))
    }

    fn delete_mapping(&self, index: &str, doc_type: &str) -> Result<()> {
        let url = self.url(&format!("{}/_mapping/{}", index, doc_type));
        let response = self.authorize(self.http.delete(url)).send()?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body: Value = response.json().unwrap_or(Value::Null);
        Err(Self::fail(status, &body))
    }

    fn get_mapping(&self, index: &str, doc_type: &str) -> Result<Option<Value>> {
        let url = self.url(&format!("{}/_mapping/{}", index, doc_type));
        let response = self.authorize(self.http.get(url)).send()?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = response.json()?;
        if !status.is_success() {
            return Err(Self::fail(status, &body));
        }
        // response shape: {<index>: {"mappings": {<type>: <definition>}}}
        let definition = body
            .pointer(&format!("/{}/mappings/{}", index, doc_type))
            .cloned();
        Ok(definition.map(|def| json!({ (doc_type): def })))
    }

    fn refresh(&self, index: &str) -> Result<()> {
        let url = self.url(&format!("{}/_refresh", index));
        let response = self.authorize(self.http.post(url)).send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body: Value = response.json().unwrap_or(Value::Null);
        Err(Self::fail(status, &body))
    }

    fn get_source(&self, index: &str, doc_type: &str, id: &str) -> Result<Option<Value>> {
        let url = self.url(&format!("{}/{}/{}/_source", index, doc_type, id));
        let response = self.authorize(self.http.get(url)).send()?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = response.json()?;
        if !status.is_success() {
            return Err(Self::fail(status, &body));
        }
        Ok(Some(body))
    }

    fn bulk(&self, actions: &[BulkAction]) -> Result<BulkSummary> {
        let body = bulk_body(actions);
        let response = self
            .authorize(
                self.http
                    .post(self.url("_bulk"))
                    .header("Content-Type", "application/x-ndjson")
                    .body(body),
            )
            .send()?;
        let status = response.status();
        let body: Value = response.json()?;
        if !status.is_success() {
            return Err(Self::fail(status, &body));
        }

        let mut summary = BulkSummary {
            items: actions.len(),
            failures: vec![],
        };
        if body.get("errors").and_then(Value::as_bool) == Some(true) {
            if let Some(items) = body.get("items").and_then(Value::as_array) {
                for item in items {
                    // each item is {"index": {...}} or {"delete": {...}}
                    let detail = item
                        .as_object()
                        .and_then(|obj| obj.values().next())
                        .cloned()
                        .unwrap_or(Value::Null);
                    if detail.get("error").is_some() {
                        summary.failures.push(BulkItemFailure {
                            id: detail
                                .get("_id")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string(),
                            reason: detail
                                .pointer("/error/reason")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string(),
                        });
                    }
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_body_index_and_delete() {
        let actions = vec![
            BulkAction::Index {
                index: "shop".to_string(),
                doc_type: "orders".to_string(),
                id: "a".to_string(),
                routing: None,
                parent: None,
                source: json!({"color": "red"}),
            },
            BulkAction::Delete {
                index: "shop".to_string(),
                doc_type: "orders".to_string(),
                id: "b".to_string(),
                routing: Some("r1".to_string()),
                parent: None,
            },
        ];
        let body = bulk_body(&actions);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["index"]["_index"], "shop");
        assert_eq!(first["index"]["_id"], "a");

        let doc: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc["color"], "red");

        let second: Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(second["delete"]["_id"], "b");
        assert_eq!(second["delete"]["_routing"], "r1");
        assert!(body.ends_with('\n'));
    }
}
