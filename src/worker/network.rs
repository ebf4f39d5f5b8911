//! Network access used by the cache manager.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::time::Duration;

use super::request::Request;
use crate::cache::Response;

/// Something that can perform a request over the network.
///
/// A returned `Err` is a transport failure. HTTP error statuses are
/// ordinary responses.
pub trait Network: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>>;
}

/// HTTP network backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("chatrex/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    Box::pin(async move {
      let response = self
        .client
        .request(request.method.clone(), request.url.clone())
        .headers(request.headers.clone())
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

      let status = response.status().as_u16();
      let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

      Ok(
        headers
          .into_iter()
          .fold(Response::new(status, body.to_vec()), |response, (name, value)| {
            response.with_header(name, value)
          }),
      )
    })
  }
}
