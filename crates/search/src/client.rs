use otq_core::{OtqError, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::lifecycle::RequestContext;

/// Connection settings for the store.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub insecure: bool,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsqlColumn {
    pub name: String,
    #[serde(rename = "type", default)]
    pub ty: String,
}

/// Column/row result of a piped query. Both keys are required; a reply
/// without them is a decode error, not an empty result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EsqlResponse {
    pub columns: Vec<EsqlColumn>,
    pub values: Vec<Vec<Value>>,
}

impl EsqlResponse {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// First cell of the first row as an unsigned count.
    pub fn single_count(&self) -> u64 {
        self.values
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

/// Thin HTTP client for an Elasticsearch-compatible store. Every call runs
/// under a [`RequestContext`] and fails with `Cancelled` or `Timeout` when
/// the context says so.
#[derive(Debug, Clone)]
pub struct EsClient {
    http: Client,
    base: String,
    basic_auth: Option<(String, Option<String>)>,
}

impl EsClient {
    pub fn new(cfg: &ClientConfig) -> Result<Self> {
        let mut headers = build_http_headers(&cfg.headers);
        if let Some(api_key) = &cfg.api_key {
            let value = HeaderValue::try_from(format!("ApiKey {api_key}"))
                .map_err(|e| OtqError::Config(format!("invalid api_key: {e}")))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let http = Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(cfg.insecure)
            .build()
            .map_err(|e| OtqError::Config(format!("failed to build http client: {e}")))?;

        let mut base = cfg.url.trim().trim_end_matches('/').to_string();
        if base.is_empty() {
            return Err(OtqError::Config("store url is empty".to_string()));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            base = format!("http://{base}");
        }

        let basic_auth = match (&cfg.username, &cfg.api_key) {
            (Some(user), None) => Some((user.clone(), cfg.password.clone())),
            _ => None,
        };

        Ok(Self {
            http,
            base,
            basic_auth,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.http.request(method, format!("{}/{}", self.base, path));
        match &self.basic_auth {
            Some((user, password)) => req.basic_auth(user, password.as_deref()),
            None => req,
        }
    }

    pub async fn info(&self, ctx: &RequestContext) -> Result<Value> {
        self.send(ctx, self.request(Method::GET, "")).await
    }

    pub async fn search(&self, ctx: &RequestContext, index: &str, body: &Value) -> Result<Value> {
        let req = self
            .request(Method::POST, &format!("{index}/_search"))
            .query(&[("ignore_unavailable", "true"), ("allow_no_indices", "true")])
            .json(body);
        self.send(ctx, req).await
    }

    pub async fn esql(&self, ctx: &RequestContext, query: &str) -> Result<EsqlResponse> {
        let req = self
            .request(Method::POST, "_query")
            .json(&json!({"query": query}));
        let value = self.send(ctx, req).await?;
        serde_json::from_value(value)
            .map_err(|e| OtqError::Decode(format!("piped query response: {e}")))
    }

    pub async fn field_caps(
        &self,
        ctx: &RequestContext,
        index: &str,
        fields: &str,
    ) -> Result<Value> {
        let req = self
            .request(Method::GET, &format!("{index}/_field_caps"))
            .query(&[
                ("fields", fields),
                ("ignore_unavailable", "true"),
                ("allow_no_indices", "true"),
            ]);
        self.send(ctx, req).await
    }

    pub async fn delete_by_query(
        &self,
        ctx: &RequestContext,
        index: &str,
        body: &Value,
    ) -> Result<Value> {
        let req = self
            .request(Method::POST, &format!("{index}/_delete_by_query"))
            .query(&[
                ("conflicts", "proceed"),
                ("ignore_unavailable", "true"),
                ("allow_no_indices", "true"),
            ])
            .json(body);
        self.send(ctx, req).await
    }

    async fn send(&self, ctx: &RequestContext, req: RequestBuilder) -> Result<Value> {
        tracing::trace!(kind = %ctx.kind(), timeout = ?ctx.timeout(), "sending store request");
        ctx.run(async move {
            let resp = req.send().await.map_err(transport_error)?;
            let status = resp.status();
            let text = resp.text().await.map_err(transport_error)?;

            if !status.is_success() {
                return Err(OtqError::Backend {
                    status: status.as_u16(),
                    body: text,
                });
            }
            serde_json::from_str(&text)
                .map_err(|e| OtqError::Decode(format!("invalid JSON from store: {e}")))
        })
        .await
    }
}

fn transport_error(err: reqwest::Error) -> OtqError {
    if err.is_timeout() {
        OtqError::Timeout(err.to_string())
    } else {
        OtqError::Transport(err.to_string())
    }
}

fn build_http_headers(headers: &[(String, String)]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (k, v) in headers {
        let name = HeaderName::try_from(k.as_str());
        let value = HeaderValue::try_from(v.as_str());
        match (name, value) {
            (Ok(name), Ok(value)) => {
                out.insert(name, value);
            }
            _ => {
                tracing::warn!(header = %k, "ignored invalid store HTTP header");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_headers_are_skipped() {
        let headers = build_http_headers(&[
            ("x-tenant".to_string(), "dev".to_string()),
            ("bad header".to_string(), "x".to_string()),
        ]);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-tenant"], "dev");
    }

    #[test]
    fn url_without_scheme_defaults_to_http() {
        let client = EsClient::new(&ClientConfig {
            url: "localhost:9200/".to_string(),
            ..ClientConfig::default()
        })
        .unwrap();
        assert_eq!(client.base_url(), "http://localhost:9200");
    }

    #[test]
    fn empty_url_is_a_config_error() {
        let err = EsClient::new(&ClientConfig::default()).unwrap_err();
        assert!(matches!(err, OtqError::Config(_)));
    }

    #[test]
    fn api_key_takes_precedence_over_basic_auth() {
        let client = EsClient::new(&ClientConfig {
            url: "http://localhost:9200".to_string(),
            username: Some("elastic".to_string()),
            password: Some("changeme".to_string()),
            api_key: Some("abc".to_string()),
            ..ClientConfig::default()
        })
        .unwrap();
        assert!(client.basic_auth.is_none());
    }

    #[test]
    fn single_count_reads_first_cell() {
        let resp: EsqlResponse = serde_json::from_value(json!({
            "columns": [{"name": "total", "type": "long"}],
            "values": [[42]]
        }))
        .unwrap();
        assert_eq!(resp.single_count(), 42);
        assert_eq!(EsqlResponse::default().single_count(), 0);
    }

    #[test]
    fn piped_response_requires_columns_and_values() {
        let missing = serde_json::from_value::<EsqlResponse>(json!({"unexpected": "shape"}));
        assert!(missing.is_err());
        let no_rows = serde_json::from_value::<EsqlResponse>(json!({"columns": []}));
        assert!(no_rows.is_err());
    }
}
