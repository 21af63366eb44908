use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use volley_config::AuthValue;

use crate::error::HostError;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
  pub method: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
  pub auth: Option<AuthValue>,
}

impl HttpRequest {
  pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
    Self {
      method: method.into(),
      url: url.into(),
      headers: Vec::new(),
      query: Vec::new(),
      body: None,
      auth: None,
    }
  }

  /// Attach a credential; applied when the request is sent.
  pub fn with_auth(mut self, auth: AuthValue) -> Self {
    self.auth = Some(auth);
    self
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
  pub status: u16,
  pub body: Vec<u8>,
  pub elapsed: Duration,
}

impl HttpResponse {
  pub fn json(&self) -> Result<Value, serde_json::Error> {
    serde_json::from_slice(&self.body)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Executes HTTP requests.
#[async_trait]
pub trait RequestSender: Send + Sync {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HostError>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestSender {
  client: reqwest::Client,
}

impl ReqwestSender {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_client(client: reqwest::Client) -> Self {
    Self { client }
  }
}

fn parse_method(method: &str) -> Result<reqwest::Method, HostError> {
  reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|_| HostError::InvalidRequest(format!("invalid HTTP method: {method}")))
}

#[async_trait]
impl RequestSender for ReqwestSender {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HostError> {
    let method = parse_method(&request.method)?;
    let mut builder = self.client.request(method, &request.url);

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if !request.query.is_empty() {
      builder = builder.query(&request.query);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }
    builder = match &request.auth {
      Some(AuthValue::Bearer { token }) => builder.bearer_auth(token),
      Some(AuthValue::Basic { username, password }) => {
        builder.basic_auth(username, Some(password))
      }
      Some(AuthValue::ApiKey { header_name, key }) => {
        builder.header(header_name.as_str(), key.as_str())
      }
      None => builder,
    };

    let start = std::time::Instant::now();
    let response = builder.send().await?;
    let status = response.status().as_u16();
    let body = response.bytes().await?.to_vec();
    let elapsed = start.elapsed();
    debug!(url = %request.url, status, elapsed_ms = elapsed.as_millis() as u64, "http_response");

    Ok(HttpResponse {
      status,
      body,
      elapsed,
    })
  }
}
