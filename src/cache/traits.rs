//! Core types for the cache store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity of a cached request: method plus absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  /// Key for a GET request, the only method this cache stores.
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: "GET".to_string(),
      url: url.into(),
    }
  }

  /// Stable, fixed-length hash used as the storage primary key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A captured response: status, headers and body.
///
/// Entries are immutable once stored; a newer write under the same key
/// replaces the whole entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Build a `200 OK` JSON response from any serializable value.
  pub fn json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
    Ok(Self {
      status: 200,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: serde_json::to_vec(value)?,
    })
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// A response read back from the store.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Result of an intercepted fetch, including where the response came from.
#[derive(Debug, Clone)]
pub struct Fetched {
  /// The response handed back to the page
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if served from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Fetched {
  /// A live response straight from the network.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// A stored response served without touching the network.
  pub fn from_cache(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: CacheSource::Cache,
      cached_at: Some(entry.cached_at),
    }
  }

  /// A stored response served because the network failed.
  pub fn offline(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: CacheSource::Offline,
      cached_at: Some(entry.cached_at),
    }
  }

  /// The pre-cached offline document served in place of a failed page load.
  pub fn offline_fallback(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: CacheSource::OfflineFallback,
      cached_at: Some(entry.cached_at),
    }
  }
}

/// Indicates where a fetched response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live response from the network
  Network,
  /// Cache hit, network not consulted
  Cache,
  /// Network failed, serving the stored entry for the same request
  Offline,
  /// Network failed for a document request, serving the offline page
  OfflineFallback,
}

impl CacheSource {
  pub fn label(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::Offline => "cache (offline)",
      CacheSource::OfflineFallback => "offline fallback",
    }
  }
}
