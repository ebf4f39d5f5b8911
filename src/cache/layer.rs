//! Cache layer that orchestrates retrieval strategies over one cache version.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CachedEntry, Fetched, RequestKey, Response};

/// Run a side task whose completion nobody waits for.
///
/// Failures are logged and otherwise dropped; the task is never retried.
pub fn spawn_best_effort<Fut>(task: &'static str, future: Fut) -> JoinHandle<()>
where
  Fut: Future<Output = Result<()>> + Send + 'static,
{
  tokio::spawn(async move {
    if let Err(e) = future.await {
      warn!(task, error = %e, "best-effort task failed");
    }
  })
}

/// Cache layer bound to a single named cache.
///
/// This layer sits between the fetch interceptor and the network,
/// implementing the network-first and cache-first strategies.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  cache_name: String,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  /// Create a cache layer over the named cache of the given storage backend.
  pub fn new(storage: Arc<S>, cache_name: impl Into<String>) -> Self {
    Self {
      storage,
      cache_name: cache_name.into(),
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Look up an entry. Storage failures are logged and read as a miss.
  pub fn lookup(&self, key: &RequestKey) -> Option<CachedEntry> {
    match self.storage.match_request(&self.cache_name, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(%key, error = %e, "cache read failed, treating as absent");
        None
      }
    }
  }

  /// Store a response and wait for the write.
  pub fn store(&self, key: &RequestKey, response: &Response) -> Result<()> {
    self.storage.put(&self.cache_name, key, response)
  }

  /// Store several responses atomically, creating the cache.
  pub fn store_all(&self, entries: &[(RequestKey, Response)]) -> Result<()> {
    self.storage.put_all(&self.cache_name, entries)
  }

  /// Schedule a write without waiting for it.
  pub fn store_in_background(&self, key: RequestKey, response: Response) {
    let storage = Arc::clone(&self.storage);
    let cache_name = self.cache_name.clone();
    spawn_best_effort("cache write", async move {
      storage.put(&cache_name, &key, &response)
    });
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Try the network; on a 200 response, store a copy in the background
  /// 2. On network failure, serve the stored entry for the same key
  /// 3. With nothing stored, the network error propagates
  pub async fn network_first<F, Fut>(&self, key: &RequestKey, fetcher: F) -> Result<Fetched>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match fetcher().await {
      Ok(response) => {
        if response.status == 200 {
          self.store_in_background(key.clone(), response.clone());
        }
        Ok(Fetched::from_network(response))
      }
      Err(err) => {
        debug!(%key, error = %err, "network failed, trying cache");
        match self.lookup(key) {
          Some(entry) => Ok(Fetched::offline(entry)),
          None => Err(err),
        }
      }
    }
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Serve a stored entry without touching the network
  /// 2. Otherwise fetch; on a 200 response, store a copy in the background
  /// 3. On network failure, serve `fallback` if given and stored
  /// 4. Otherwise the network error propagates
  pub async fn cache_first<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
    fallback: Option<&RequestKey>,
  ) -> Result<Fetched>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    if let Some(entry) = self.lookup(key) {
      return Ok(Fetched::from_cache(entry));
    }

    match fetcher().await {
      Ok(response) => {
        if response.status == 200 {
          self.store_in_background(key.clone(), response.clone());
        }
        Ok(Fetched::from_network(response))
      }
      Err(err) => {
        if let Some(entry) = fallback.and_then(|fallback| self.lookup(fallback)) {
          debug!(%key, "network failed, serving offline page");
          return Ok(Fetched::offline_fallback(entry));
        }
        Err(err)
      }
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      cache_name: self.cache_name.clone(),
    }
  }
}
