use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, PRAGMA};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::HttpConfig;
use crate::error::NetworkError;

use super::{CacheMode, FetchOptions, Network, Request, RequestMode, Response, ResponseType};

/// HTTP client wrapper serving one origin
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  pub fn new(config: &HttpConfig, origin: Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout))
      .connect_timeout(Duration::from_secs(config.connect_timeout))
      .user_agent(config.user_agent.as_str())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request, options: FetchOptions) -> Result<Response, NetworkError> {
    let cross_origin = request.url.origin() != self.origin.origin();
    if cross_origin && request.mode == RequestMode::SameOrigin {
      return Err(NetworkError::ModeViolation(request.url.to_string()));
    }

    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if options.cache == CacheMode::Reload {
      builder = builder
        .header(CACHE_CONTROL, "no-cache")
        .header(PRAGMA, "no-cache");
    }

    let transport = |source: reqwest::Error| NetworkError::Transport {
      url: request.url.to_string(),
      source,
    };

    let response = builder.send().await.map_err(|source: reqwest::Error| {
      if source.is_connect() {
        debug!(url = %request.url, error = %source, "Host unreachable");
        NetworkError::Unavailable(request.url.to_string())
      } else {
        transport(source)
      }
    })?;
    let status = response.status();
    let final_url = response.url().clone();

    // Redirects may leave the origin
    let lands_cross_origin = final_url.origin() != self.origin.origin();
    if lands_cross_origin && request.mode == RequestMode::SameOrigin {
      return Err(NetworkError::ModeViolation(final_url.to_string()));
    }

    let allow_origin = response
      .headers()
      .get(ACCESS_CONTROL_ALLOW_ORIGIN)
      .and_then(|v| v.to_str().ok());
    let response_type =
      classify_response(request.mode, lands_cross_origin, allow_origin, &self.origin)
        .ok_or_else(|| NetworkError::CorsRejected(final_url.to_string()))?;

    let headers = header_pairs(response.headers());
    let body = response.bytes().await.map_err(transport)?;

    debug!(
      url = %request.url,
      status = status.as_u16(),
      kind = response_type.as_str(),
      bytes = body.len(),
      "Fetched from network"
    );

    Ok(Response::new(status, response_type, final_url, body).with_headers(headers))
  }
}

/// Decide the response type the page would observe.
///
/// Returns `None` when a CORS-mode request gets a response the server did not share with
/// `origin`; a browser fails such a fetch outright.
pub(crate) fn classify_response(
  mode: RequestMode,
  cross_origin: bool,
  allow_origin: Option<&str>,
  origin: &Url,
) -> Option<ResponseType> {
  if !cross_origin {
    return Some(ResponseType::Basic);
  }

  if mode == RequestMode::NoCors {
    return Some(ResponseType::Opaque);
  }

  let ours = origin.origin().ascii_serialization();
  match allow_origin.map(str::trim) {
    Some("*") => Some(ResponseType::Cors),
    Some(allowed) if allowed == ours => Some(ResponseType::Cors),
    _ => None,
  }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect()
}
