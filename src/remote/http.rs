use color_eyre::{eyre::eyre, Result};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{RemoteError, RemoteService};
use crate::config::{Config, RemoteConfig};
use crate::queue::EntityType;

/// REST client for the remote data service.
///
/// Each entity type is a collection at `{url}/{entity_type}`, each record a
/// resource at `{url}/{entity_type}/{id}`.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let base_url = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid remote url '{}': {}", config.url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Remote url '{}' cannot be used as a base", config.url));
    }

    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token: Config::get_api_token(),
    })
  }

  fn endpoint(&self, entity_type: EntityType, id: Option<&str>) -> Result<Url, RemoteError> {
    let mut url = self.base_url.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| RemoteError::Invalid(format!("bad base url {}", self.base_url)))?;
      segments.pop_if_empty().push(entity_type.as_str());
      if let Some(id) = id {
        segments.push(id);
      }
    }
    Ok(url)
  }

  /// Send a request and return the status with the raw body.
  async fn send(
    &self,
    method: Method,
    url: Url,
    body: Option<&Value>,
  ) -> Result<(StatusCode, Vec<u8>), RemoteError> {
    let mut request = self
      .client
      .request(method, url)
      .header(ACCEPT, "application/json");

    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      let bytes = serde_json::to_vec(body).map_err(|e| RemoteError::Invalid(e.to_string()))?;
      request = request.header(CONTENT_TYPE, "application/json").body(bytes);
    }

    let response = request.send().await.map_err(map_transport_error)?;
    let status = response.status();
    let bytes = response.bytes().await.map_err(map_transport_error)?;

    Ok((status, bytes.to_vec()))
  }
}

fn map_transport_error(e: reqwest::Error) -> RemoteError {
  if e.is_connect() {
    RemoteError::Offline
  } else {
    RemoteError::Transport(e.to_string())
  }
}

fn rejected(status: StatusCode, body: &[u8]) -> RemoteError {
  RemoteError::Rejected {
    status: status.as_u16(),
    message: String::from_utf8_lossy(body).trim().to_string(),
  }
}

/// Parse a record from a response body. Empty bodies fall back to what we sent.
fn parse_record(body: &[u8], sent: &Value) -> Result<Value, RemoteError> {
  if body.iter().all(u8::is_ascii_whitespace) {
    return Ok(sent.clone());
  }
  let value: Value =
    serde_json::from_slice(body).map_err(|e| RemoteError::Transport(e.to_string()))?;

  // Collection endpoints commonly answer with a one-element array
  Ok(match value {
    Value::Array(mut rows) if rows.len() == 1 => rows.remove(0),
    other => other,
  })
}

fn create_response(status: StatusCode, body: &[u8], sent: &Value) -> Result<Value, RemoteError> {
  match status {
    s if s.is_success() => parse_record(body, sent),
    // The client id already exists: an earlier attempt landed
    StatusCode::CONFLICT => Ok(sent.clone()),
    s => Err(rejected(s, body)),
  }
}

fn update_response(status: StatusCode, body: &[u8], sent: &Value) -> Result<Value, RemoteError> {
  if status.is_success() {
    parse_record(body, sent)
  } else {
    Err(rejected(status, body))
  }
}

fn delete_response(status: StatusCode, body: &[u8]) -> Result<(), RemoteError> {
  match status {
    s if s.is_success() => Ok(()),
    StatusCode::NOT_FOUND | StatusCode::GONE => Ok(()),
    s => Err(rejected(s, body)),
  }
}

impl RemoteService for HttpRemote {
  async fn create(&self, entity_type: EntityType, payload: &Value) -> Result<Value, RemoteError> {
    let url = self.endpoint(entity_type, None)?;
    let (status, body) = self.send(Method::POST, url, Some(payload)).await?;
    create_response(status, &body, payload)
  }

  async fn update(
    &self,
    entity_type: EntityType,
    id: &str,
    payload: &Value,
  ) -> Result<Value, RemoteError> {
    let url = self.endpoint(entity_type, Some(id))?;
    let (status, body) = self.send(Method::PATCH, url, Some(payload)).await?;
    update_response(status, &body, payload)
  }

  async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), RemoteError> {
    let url = self.endpoint(entity_type, Some(id))?;
    let (status, body) = self.send(Method::DELETE, url, None).await?;
    delete_response(status, &body)
  }

  async fn fetch_all(&self, entity_type: EntityType) -> Result<Vec<Value>, RemoteError> {
    let url = self.endpoint(entity_type, None)?;
    let (status, body) = self.send(Method::GET, url, None).await?;

    if !status.is_success() {
      return Err(rejected(status, &body));
    }

    let value: Value =
      serde_json::from_slice(&body).map_err(|e| RemoteError::Transport(e.to_string()))?;
    match value {
      Value::Array(rows) => Ok(rows),
      Value::Object(mut map) => match map.remove("data") {
        Some(Value::Array(rows)) => Ok(rows),
        _ => Err(RemoteError::Transport(format!(
          "unexpected {} listing shape",
          entity_type
        ))),
      },
      _ => Err(RemoteError::Transport(format!(
        "unexpected {} listing shape",
        entity_type
      ))),
    }
  }
}
