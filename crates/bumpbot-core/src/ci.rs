use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde_json::Value;

use crate::config::Config;
use crate::error::{CiHttpCause, CiHttpError, Result};

/// The slice of the CI server's JSON API the bot needs. A trait so the
/// conflict detector and pipeline can be driven by a fake in tests.
#[async_trait]
pub trait CiApi: Send + Sync {
    async fn get_json(&self, path: &str) -> Result<Value>;

    /// POST with query-string parameters (the CI server's parameterized
    /// build endpoint takes them that way).
    async fn post_json(&self, path: &str, params: &[(&str, &str)]) -> Result<Value>;
}

/// Thin authenticated wrapper over the CI server's HTTP API. Any non-2xx
/// or network failure comes back as [`CiHttpError`] with the request
/// metadata intact; that error text is what users see.
pub struct CiClient {
    base_url: String,
    username: String,
    api_token: String,
    http: reqwest::Client,
}

impl CiClient {
    pub fn new(base_url: impl Into<String>, username: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            username: username.into(),
            api_token: api_token.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.ci_endpoint, &config.ci_username, &config.ci_api_token)
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn error(&self, method: &'static str, path: &str, cause: CiHttpCause) -> CiHttpError {
        CiHttpError {
            base_url: self.base_url.clone(),
            method,
            path: path.to_string(),
            username: self.username.clone(),
            cause,
        }
    }

    async fn send(&self, method: &'static str, path: &str, params: &[(&str, &str)]) -> Result<Value> {
        let request = match method {
            "POST" => self.http.post(self.url(path)).query(params),
            _ => self.http.get(self.url(path)),
        };
        let response = request
            .basic_auth(&self.username, Some(&self.api_token))
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.error(method, path, CiHttpCause::Network(e.to_string())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.error(method, path, CiHttpCause::Network(e.to_string())))?;

        if !status.is_success() {
            return Err(self
                .error(
                    method,
                    path,
                    CiHttpCause::HttpStatus {
                        status: status.as_u16(),
                        body,
                    },
                )
                .into());
        }

        // The parameterized-build trigger answers 201 with an empty body.
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| {
            self.error(
                method,
                path,
                CiHttpCause::InvalidResponse(format!("invalid JSON response: {e}")),
            )
            .into()
        })
    }
}

#[async_trait]
impl CiApi for CiClient {
    async fn get_json(&self, path: &str) -> Result<Value> {
        self.send("GET", path, &[]).await
    }

    async fn post_json(&self, path: &str, params: &[(&str, &str)]) -> Result<Value> {
        self.send("POST", path, params).await
    }
}
