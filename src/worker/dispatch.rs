//! Request classification and routing.
//!
//! Everything here is decided from the request shape alone, before any
//! network or cache I/O.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeSet;
use url::{Origin, Url};

use super::lifecycle::Generation;
use super::types::{Request, RequestIdentity};
use crate::config::Config;

/// An allowed external API origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiOrigin {
  /// `https://api.supabase.co`
  Exact(Origin),
  /// `https://*.supabase.co`: any subdomain, never the bare domain
  Subdomains {
    scheme: String,
    /// Includes the leading dot, e.g. `.supabase.co`
    host_suffix: String,
    port: Option<u16>,
  },
}

impl ApiOrigin {
  pub fn parse(s: &str) -> Result<Self> {
    let (scheme, rest) = s
      .split_once("://")
      .ok_or_else(|| eyre!("API origin '{}' is missing a scheme", s))?;

    if let Some(domain) = rest.strip_prefix("*.") {
      if domain.is_empty() || domain.starts_with('.') {
        return Err(eyre!("API origin '{}' has an empty wildcard domain", s));
      }
      // Validate the remainder with a concrete host in place of the wildcard
      let probe = Url::parse(&format!("{}://x.{}", scheme, domain))
        .map_err(|e| eyre!("Invalid API origin '{}': {}", s, e))?;
      let host = probe
        .host_str()
        .ok_or_else(|| eyre!("API origin '{}' has no host", s))?;
      return Ok(Self::Subdomains {
        scheme: probe.scheme().to_string(),
        host_suffix: host[1..].to_string(),
        port: probe.port_or_known_default(),
      });
    }

    let url = Url::parse(s).map_err(|e| eyre!("Invalid API origin '{}': {}", s, e))?;
    if url.host_str().is_none() {
      return Err(eyre!("API origin '{}' has no host", s));
    }
    Ok(Self::Exact(url.origin()))
  }

  pub fn matches(&self, url: &Url) -> bool {
    match self {
      Self::Exact(origin) => &url.origin() == origin,
      Self::Subdomains {
        scheme,
        host_suffix,
        port,
      } => {
        let Some(host) = url.host_str() else {
          return false;
        };
        url.scheme() == scheme
          && host.len() > host_suffix.len()
          && host.ends_with(host_suffix.as_str())
          && url.port_or_known_default() == *port
      }
    }
  }
}

/// Explicit allowlist of origins the worker manages.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
  own: Origin,
  api: Vec<ApiOrigin>,
}

impl OriginPolicy {
  pub fn new(own: &Url, api: Vec<ApiOrigin>) -> Self {
    Self {
      own: own.origin(),
      api,
    }
  }

  pub fn is_own(&self, url: &Url) -> bool {
    url.origin() == self.own
  }

  pub fn is_api(&self, url: &Url) -> bool {
    self.api.iter().any(|origin| origin.matches(url))
  }
}

/// What kind of request this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  /// Outside the managed origins; not intercepted
  PassThrough,
  Api,
  Asset,
  Navigation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

/// The handling decided for an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
  pub classification: Classification,
  pub strategy: Strategy,
  pub store: String,
}

/// Classifies requests and maps each class to a strategy and store.
#[derive(Debug, Clone)]
pub struct Dispatcher {
  policy: OriginPolicy,
  generation: Generation,
  asset_extensions: BTreeSet<String>,
  revalidate_extensions: BTreeSet<String>,
  offline_page: RequestIdentity,
  offline_fallback_denylist: Vec<String>,
}

impl Dispatcher {
  pub fn from_config(config: &Config) -> Result<Self> {
    let own = parse_origin_url(&config.origin)?;
    let api = config
      .api_origins
      .iter()
      .map(|s| ApiOrigin::parse(s))
      .collect::<Result<Vec<_>>>()?;
    let offline_page = own
      .join(&config.offline_page)
      .map_err(|e| eyre!("Invalid offline page '{}': {}", config.offline_page, e))?;

    Ok(Self {
      policy: OriginPolicy::new(&own, api),
      generation: config.generation(),
      asset_extensions: config.asset_extensions.clone(),
      revalidate_extensions: config.revalidate_extensions.clone(),
      offline_page: RequestIdentity::new(&reqwest::Method::GET, &offline_page),
      offline_fallback_denylist: config.offline_fallback_denylist.clone(),
    })
  }

  /// Classification rules, in priority order:
  /// foreign origin, API origin, asset extension, everything else.
  pub fn classify(&self, request: &Request) -> Classification {
    let url = &request.url;
    let is_api = self.policy.is_api(url);

    if !self.policy.is_own(url) && !is_api {
      return Classification::PassThrough;
    }
    if is_api {
      return Classification::Api;
    }
    match path_extension(url) {
      Some(ext) if self.asset_extensions.contains(&ext) => Classification::Asset,
      _ => Classification::Navigation,
    }
  }

  /// `None` means the request is not intercepted.
  pub fn route(&self, request: &Request) -> Option<Route> {
    let classification = self.classify(request);
    let (strategy, store) = match classification {
      Classification::PassThrough => return None,
      Classification::Api => (Strategy::NetworkFirst, &self.generation.api),
      Classification::Asset => {
        let revalidate = path_extension(&request.url)
          .map(|ext| self.revalidate_extensions.contains(&ext))
          .unwrap_or(false);
        if revalidate {
          (Strategy::StaleWhileRevalidate, &self.generation.assets)
        } else {
          (Strategy::CacheFirst, &self.generation.assets)
        }
      }
      Classification::Navigation => (Strategy::NetworkFirst, &self.generation.shell),
    };

    Some(Route {
      classification,
      strategy,
      store: store.clone(),
    })
  }

  /// The offline page identity for a failed request, if it qualifies.
  pub fn offline_page_for(&self, request: &Request) -> Option<RequestIdentity> {
    if !request.is_navigation() || !self.policy.is_own(&request.url) {
      return None;
    }
    let path = request.url.path();
    if self
      .offline_fallback_denylist
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
    {
      return None;
    }
    Some(self.offline_page.clone())
  }
}

/// Parse the application's own origin, rejecting anything without a host.
pub fn parse_origin_url(origin: &str) -> Result<Url> {
  let url = Url::parse(origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;
  if url.host_str().is_none() {
    return Err(eyre!("Origin '{}' has no host", origin));
  }
  Ok(url)
}

/// Lower-cased extension of the last path segment; the query is ignored.
fn path_extension(url: &Url) -> Option<String> {
  let segment = url.path().rsplit('/').next()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() || ext.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}
