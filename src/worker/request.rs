//! Intercepted requests and how they are routed.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Method;
use url::Url;

use crate::cache::RequestKey;

/// An outbound request as seen by the fetch interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Set the `Accept` header.
  pub fn with_accept(mut self, accept: &'static str) -> Self {
    self.headers.insert(ACCEPT, HeaderValue::from_static(accept));
    self
  }

  /// Whether the caller asked for an HTML document.
  pub fn accepts_html(&self) -> bool {
    self
      .headers
      .get_all(ACCEPT)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .any(|v| v.contains("text/html"))
  }

  pub fn key(&self) -> RequestKey {
    RequestKey {
      method: self.method.as_str().to_string(),
      url: self.url.to_string(),
    }
  }
}

/// Which strategy the interceptor applies to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Cross-origin or non-GET: not intercepted
  Passthrough,
  /// Backend traffic: network first, cache as fallback
  NetworkFirst,
  /// Everything else on the origin: cache first, network on miss
  CacheFirst,
}

/// Classify a request against the served origin and the backend path markers.
pub fn classify(request: &Request, origin: &Url, api_markers: &[String]) -> RequestClass {
  if request.method != Method::GET || request.url.origin() != origin.origin() {
    return RequestClass::Passthrough;
  }

  let path = request.url.path();
  if api_markers.iter().any(|marker| path.contains(marker.as_str())) {
    RequestClass::NetworkFirst
  } else {
    RequestClass::CacheFirst
  }
}
