//! HTTP client for the cafe server.
//!
//! Implements the fetcher traits the cache tiers are generic over, so the
//! caches never see reqwest directly.

use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::cache::{RecordSource, ResourceFetcher, UpdateSource, UpdateTimestamps};
use crate::error::{CacheError, Result};
use crate::models::Notice;

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

const UPDATES_PATH: &str = "system/updates";
const NOTICES_PATH: &str = "notices";

/// API client wrapper
#[derive(Clone)]
pub struct ApiClient {
  client: Client,
  base_url: Url,
  token: Option<String>,
}

impl ApiClient {
  pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
    let client = Client::builder()
      .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
      .build()?;

    Ok(Self {
      client,
      base_url: normalize_base(base_url)?,
      token,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Absolute URLs pass through; anything else is relative to the base.
  pub fn resolve_url(&self, target: &str) -> Result<Url> {
    match Url::parse(target) {
      Ok(url) => Ok(url),
      Err(url::ParseError::RelativeUrlWithoutBase) => self
        .base_url
        .join(target)
        .map_err(|e| CacheError::Network(format!("invalid url {}: {}", target, e))),
      Err(e) => Err(CacheError::Network(format!("invalid url {}: {}", target, e))),
    }
  }

  async fn get(&self, url: Url, accept: &str) -> Result<reqwest::Response> {
    debug!(%url, "GET");
    let mut request = self.client.get(url).header(header::ACCEPT, accept);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    Self::check_response(response).await
  }

  /// Check if response is successful, returning an error with body if not.
  async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
      Ok(response)
    } else {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      Err(CacheError::from_status(status, &body))
    }
  }

  async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    let url = self.resolve_url(path)?;
    let body = self.get(url, "application/json").await?.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
  }
}

fn normalize_base(base_url: &str) -> Result<Url> {
  let mut base = base_url.trim().to_string();
  if !base.ends_with('/') {
    base.push('/');
  }
  Url::parse(&base).map_err(|e| CacheError::Network(format!("invalid base url {}: {}", base_url, e)))
}

impl ResourceFetcher for ApiClient {
  async fn fetch_bytes(&self, key: &str) -> Result<Vec<u8>> {
    let url = self.resolve_url(key)?;
    let response = self.get(url, "image/*, application/octet-stream").await?;
    Ok(response.bytes().await?.to_vec())
  }
}

impl UpdateSource for ApiClient {
  async fn fetch_updates(&self) -> Result<UpdateTimestamps> {
    self.get_json(UPDATES_PATH).await
  }
}

impl RecordSource<Notice> for ApiClient {
  async fn fetch_all(&self) -> Result<Vec<Notice>> {
    self.get_json(NOTICES_PATH).await
  }

  async fn fetch_one(&self, id: i64) -> Result<Option<Notice>> {
    match self.get_json(&format!("{}/{}", NOTICES_PATH, id)).await {
      Ok(notice) => Ok(Some(notice)),
      Err(CacheError::Http { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => Ok(None),
      Err(e) => Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::extract::Path;
  use axum::http::{HeaderMap, StatusCode as AxumStatus};
  use axum::routing::get;
  use axum::{Json, Router};
  use serde_json::json;

  async fn serve() -> String {
    let app = Router::new()
      .route(
        "/api/system/updates",
        get(|| async { Json(json!({"noticeLastUpdated": 42, "userLastUpdated": 7})) }),
      )
      .route(
        "/api/notices",
        get(|| async {
          Json(json!([
            {"id": 1, "title": "a", "content": "x", "authorUsername": "mika",
             "createdAt": 10, "updatedAt": 10},
            {"id": 2, "title": "b", "content": "y", "pinned": true,
             "authorUsername": "mika", "createdAt": 20, "updatedAt": 21}
          ]))
        }),
      )
      .route(
        "/api/notices/:id",
        get(|Path(id): Path<i64>| async move {
          if id == 1 {
            Ok(Json(json!({"id": 1, "title": "a", "content": "x",
              "authorUsername": "mika", "createdAt": 10, "updatedAt": 10})))
          } else {
            Err((AxumStatus::NOT_FOUND, "no such notice"))
          }
        }),
      )
      .route(
        "/avatars/mika.png",
        get(|headers: HeaderMap| async move {
          match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some("Bearer secret") => Ok(vec![0x89u8, b'P', b'N', b'G']),
            _ => Err((AxumStatus::UNAUTHORIZED, "missing token")),
          }
        }),
      )
      .route(
        "/api/broken",
        get(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "down for maintenance") }),
      );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
  }

  #[test]
  fn test_base_url_gets_trailing_slash() {
    let client = ApiClient::new("https://cafe.example.org/api/v1", None).unwrap();
    assert_eq!(client.base_url().as_str(), "https://cafe.example.org/api/v1/");
    assert_eq!(
      client.resolve_url("notices").unwrap().as_str(),
      "https://cafe.example.org/api/v1/notices"
    );
    assert_eq!(
      client.resolve_url("/avatars/a.png").unwrap().as_str(),
      "https://cafe.example.org/avatars/a.png"
    );
    assert_eq!(
      client.resolve_url("https://cdn.example.org/a.png").unwrap().as_str(),
      "https://cdn.example.org/a.png"
    );
  }

  #[test]
  fn test_invalid_base_url_is_rejected() {
    assert!(ApiClient::new("not a url", None).is_err());
  }

  #[tokio::test]
  async fn test_fetch_updates() {
    let base = serve().await;
    let client = ApiClient::new(&format!("{}/api", base), None).unwrap();

    let updates = client.fetch_updates().await.unwrap();
    assert_eq!(updates.notice_last_updated, 42);
    assert_eq!(updates.user_last_updated, 7);
    assert_eq!(updates.audit_last_updated, 0);
  }

  #[tokio::test]
  async fn test_fetch_notices() {
    let base = serve().await;
    let client = ApiClient::new(&format!("{}/api", base), None).unwrap();

    let notices = client.fetch_all().await.unwrap();
    assert_eq!(notices.len(), 2);
    assert!(notices[1].pinned);

    assert_eq!(client.fetch_one(1).await.unwrap().unwrap().title, "a");
    assert_eq!(client.fetch_one(99).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_fetch_bytes_sends_bearer_token() {
    let base = serve().await;

    let authed = ApiClient::new(&format!("{}/api", base), Some("secret".into())).unwrap();
    let bytes = authed.fetch_bytes("/avatars/mika.png").await.unwrap();
    assert_eq!(bytes, vec![0x89u8, b'P', b'N', b'G']);

    let anonymous = ApiClient::new(&format!("{}/api", base), None).unwrap();
    let err = anonymous.fetch_bytes("/avatars/mika.png").await.unwrap_err();
    assert_eq!(
      err,
      CacheError::Http {
        status: 401,
        message: "missing token".into()
      }
    );
  }

  #[tokio::test]
  async fn test_server_error_is_transient() {
    let base = serve().await;
    let client = ApiClient::new(&format!("{}/api", base), None).unwrap();

    let err = client.get_json::<serde_json::Value>("broken").await.unwrap_err();
    assert!(err.is_transient());
    assert!(err.to_string().contains("down for maintenance"));
  }

  #[tokio::test]
  async fn test_unreachable_server_is_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = ApiClient::new(&format!("http://{}/api", addr), None).unwrap();
    let err = client.fetch_updates().await.unwrap_err();
    assert!(matches!(err, CacheError::Network(_)));
  }
}
