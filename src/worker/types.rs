//! Request and response snapshots handled by the worker.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// What the page intends to do with the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  /// `fetch()` / XHR
  #[default]
  Empty,
  Document,
  Image,
  Script,
  Style,
  Font,
  Manifest,
}

impl std::str::FromStr for Destination {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "" | "empty" => Ok(Self::Empty),
      "document" => Ok(Self::Document),
      "image" => Ok(Self::Image),
      "script" => Ok(Self::Script),
      "style" => Ok(Self::Style),
      "font" => Ok(Self::Font),
      "manifest" => Ok(Self::Manifest),
      other => Err(eyre!("Unknown request destination: {}", other)),
    }
  }
}

/// Request mode; only `Navigate` is treated specially.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  Navigate,
  #[default]
  Cors,
  NoCors,
  SameOrigin,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  pub url: Url,
  pub method: Method,
  pub destination: Destination,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
}

impl Request {
  /// A plain `GET` with no destination.
  pub fn get(url: Url) -> Self {
    Self {
      url,
      method: Method::GET,
      destination: Destination::Empty,
      mode: RequestMode::Cors,
      headers: Vec::new(),
    }
  }

  /// A top-level document navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      destination: Destination::Document,
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  pub fn identity(&self) -> RequestIdentity {
    RequestIdentity::new(&self.method, &self.url)
  }
}

/// Cache key: upper-cased method plus the URL without its fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestIdentity {
  pub method: String,
  pub url: String,
}

impl RequestIdentity {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.as_str().to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  /// Only safe methods are stored; replaying a cached write would lie.
  pub fn is_cacheable(&self) -> bool {
    self.method == "GET" || self.method == "HEAD"
  }

  /// SHA256 hex digest of `"METHOD URL"`, used as a fixed-length storage key.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestIdentity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Immutable snapshot of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl StoredResponse {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
    }
  }

  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Synthetic response for "no network and nothing cached".
  pub fn network_error() -> Self {
    Self::new(
      408,
      vec![("Content-Type".to_string(), "text/plain".to_string())],
      "Network error occurred",
    )
  }

  /// Transparent 1x1 SVG served for images that cannot be fetched.
  pub fn placeholder_image() -> Self {
    Self::new(
      200,
      vec![("Content-Type".to_string(), "image/svg+xml".to_string())],
      PLACEHOLDER_SVG,
    )
  }
}

const PLACEHOLDER_SVG: &str =
  r#"<svg xmlns="http://www.w3.org/2000/svg" width="1" height="1" viewBox="0 0 1 1"></svg>"#;
