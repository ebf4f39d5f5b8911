//! Polling subscription used as the live message feed.
//!
//! `LiveQuery<T>` refetches on a fixed interval and keeps the last good
//! value when a refetch fails, so a feed that loses the network freezes on
//! its latest snapshot instead of going blank.
//!
//! # Example
//!
//! ```ignore
//! let mut feed = LiveQuery::new(move || {
//!     let manager = manager.clone();
//!     async move { manager.fetch(request()).await.map_err(|e| e.to_string()) }
//! })
//! .with_interval(Duration::from_secs(2));
//!
//! // In event loop tick
//! feed.tick();
//! if feed.poll() {
//!     if let Some(data) = feed.data() {
//!         controller.handle_snapshot(data.clone());
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// First fetch in flight, no data yet
  Loading,
  /// Latest data received
  Success(T),
  /// Failed before any data arrived
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;

type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

/// Interval-driven query with state management.
pub struct LiveQuery<T> {
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<Result<T, String>>>,
  fetched_at: Option<Instant>,
  interval: Duration,
}

impl<T: Send + 'static> LiveQuery<T> {
  /// Create a live query around a fetcher closure. The closure is called
  /// once per refetch.
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      fetcher: Box::new(move || Box::pin(fetcher())),
      receiver: None,
      fetched_at: None,
      interval: Duration::from_secs(2),
    }
  }

  /// Set how long to wait between fetch attempts.
  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_fetching(&self) -> bool {
    self.receiver.is_some()
  }

  /// Start a fetch now unless one is already in flight.
  pub fn fetch(&mut self) {
    if self.is_fetching() {
      return;
    }
    self.start_fetch();
  }

  /// Start a fetch if the interval has elapsed since the last attempt.
  pub fn tick(&mut self) {
    let due = self
      .fetched_at
      .map_or(true, |at| at.elapsed() >= self.interval);
    if due {
      self.fetch();
    }
  }

  /// Poll for the result of a pending fetch.
  ///
  /// Returns `true` when new data arrived or the query failed before
  /// receiving any data. A failed refetch keeps the previous data.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    let result = match receiver.try_recv() {
      Ok(result) => result,
      Err(mpsc::error::TryRecvError::Empty) => return false,
      Err(mpsc::error::TryRecvError::Disconnected) => Err("Query was cancelled".to_string()),
    };
    self.receiver = None;

    match result {
      Ok(data) => {
        self.state = QueryState::Success(data);
        true
      }
      Err(error) => {
        if self.state.is_success() {
          debug!(%error, "refetch failed, keeping last data");
          false
        } else {
          self.state = QueryState::Error(error);
          true
        }
      }
    }
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.fetched_at = Some(Instant::now());
    if !self.state.is_success() {
      self.state = QueryState::Loading;
    }

    let future = (self.fetcher)();
    tokio::spawn(async move {
      let result = future.await;
      // Receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for LiveQuery<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LiveQuery")
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .field("interval", &self.interval)
      .finish_non_exhaustive()
  }
}
