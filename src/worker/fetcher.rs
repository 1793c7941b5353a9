//! Network access for the worker.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;

use super::types::{Request, StoredResponse};
use crate::error::NetworkError;

/// Performs a single network attempt for a request.
///
/// Any HTTP status is a response; only transport failures are errors.
pub trait Fetcher: Clone + Send + Sync + 'static {
  fn fetch(
    &self,
    request: &Request,
  ) -> impl Future<Output = Result<StoredResponse, NetworkError>> + Send;
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offline-cache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch(
    &self,
    request: &Request,
  ) -> impl Future<Output = Result<StoredResponse, NetworkError>> + Send {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }

    async move {
      let response = builder.send().await.map_err(network_error)?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
          (
            name.as_str().to_string(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
          )
        })
        .collect();
      let body = response.bytes().await.map_err(network_error)?;

      Ok(StoredResponse {
        status,
        headers,
        body: body.to_vec(),
      })
    }
  }
}

fn network_error(e: reqwest::Error) -> NetworkError {
  if e.is_timeout() {
    NetworkError::Timeout(e.to_string())
  } else if e.is_builder() {
    NetworkError::InvalidRequest(e.to_string())
  } else {
    NetworkError::Unavailable(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  #[tokio::test]
  async fn test_unreachable_host_is_network_error() {
    let fetcher = HttpFetcher::new().unwrap();
    // Port 9 on localhost: nothing listens, connection is refused
    let request = Request::get(Url::parse("http://127.0.0.1:9/").unwrap());

    let err = fetcher.fetch(&request).await.unwrap_err();
    assert!(matches!(
      err,
      NetworkError::Unavailable(_) | NetworkError::Timeout(_)
    ));
  }

  #[tokio::test]
  async fn test_invalid_header_is_invalid_request() {
    let fetcher = HttpFetcher::new().unwrap();
    let request = Request::get(Url::parse("http://127.0.0.1:9/").unwrap())
      .with_header("bad header", "x");

    let err = fetcher.fetch(&request).await.unwrap_err();
    assert!(matches!(err, NetworkError::InvalidRequest(_)));
  }
}
