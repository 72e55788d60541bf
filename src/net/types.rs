use bytes::Bytes;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use url::Url;

/// How a request may reach resources on other origins
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
  /// Top-level document load
  Navigate,
  SameOrigin,
  /// Cross-origin allowed when the server shares the response
  #[default]
  Cors,
  /// Cross-origin allowed, the response comes back opaque
  NoCors,
}

/// Classification of a response relative to the serving origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  /// Same-origin
  Basic,
  /// Cross-origin, shared through CORS
  Cors,
  /// Cross-origin, not readable by the page
  Opaque,
  Error,
}

impl ResponseType {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::Error => "error",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(Self::Basic),
      "cors" => Some(Self::Cors),
      "opaque" => Some(Self::Opaque),
      "error" => Some(Self::Error),
      _ => None,
    }
  }

  /// Whether the payload is readable by the page, and therefore eligible for caching.
  pub fn is_readable(self) -> bool {
    matches!(self, Self::Basic | Self::Cors)
  }
}

/// An outbound request as seen by the interceptor
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      mode: RequestMode::default(),
      headers: Vec::new(),
    }
  }

  /// A `cors` GET, the default shape of a constructed request.
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }
}

/// A response with its payload fully buffered.
///
/// The body is handed out once through [`Response::into_body`]. Anything that needs a second
/// readable copy (the cache write in the network-fallback path) must take it with
/// [`Response::duplicate`] before the original is returned.
#[derive(Debug)]
pub struct Response {
  status: StatusCode,
  response_type: ResponseType,
  url: Url,
  headers: Vec<(String, String)>,
  body: Bytes,
}

impl Response {
  pub fn new(
    status: StatusCode,
    response_type: ResponseType,
    url: Url,
    body: impl Into<Bytes>,
  ) -> Self {
    Self {
      status,
      response_type,
      url,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
    self.headers = headers;
    self
  }

  pub fn status(&self) -> StatusCode {
    self.status
  }

  pub fn response_type(&self) -> ResponseType {
    self.response_type
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn headers(&self) -> &[(String, String)] {
    &self.headers
  }

  /// Case-insensitive header lookup, first match wins.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// 2xx status.
  pub fn is_ok(&self) -> bool {
    self.status.is_success()
  }

  pub fn body_len(&self) -> usize {
    self.body.len()
  }

  /// Borrow the payload without consuming it, for writing it to storage.
  pub(crate) fn body(&self) -> &Bytes {
    &self.body
  }

  pub fn into_body(self) -> Bytes {
    self.body
  }

  /// An independent copy with its own readable body.
  pub fn duplicate(&self) -> Self {
    Self {
      status: self.status,
      response_type: self.response_type,
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: Bytes::copy_from_slice(&self.body),
    }
  }
}
