//! Online/offline signal and the monitor pages observe it through.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Transition {
  Online,
  Offline,
}

struct Listener {
  id: u64,
  on: Transition,
  callback: Callback,
}

/// The runtime-owned connectivity flag.
///
/// Only the runtime flips it; listeners run synchronously on the thread that
/// reports the transition and must not block.
pub struct NetworkStatus {
  online: AtomicBool,
  next_id: AtomicU64,
  listeners: Mutex<Vec<Listener>>,
}

impl NetworkStatus {
  pub fn new(online: bool) -> Arc<Self> {
    Arc::new(Self {
      online: AtomicBool::new(online),
      next_id: AtomicU64::new(0),
      listeners: Mutex::new(Vec::new()),
    })
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Report the current connectivity. Listeners fire only on a change.
  pub fn set_online(&self, online: bool) {
    if self.online.swap(online, Ordering::SeqCst) == online {
      return;
    }
    debug!(online, "connectivity changed");

    let wanted = if online {
      Transition::Online
    } else {
      Transition::Offline
    };
    // Snapshot callbacks so a listener may add or remove listeners
    let callbacks: Vec<Callback> = match self.listeners.lock() {
      Ok(listeners) => listeners
        .iter()
        .filter(|l| l.on == wanted)
        .map(|l| Arc::clone(&l.callback))
        .collect(),
      Err(_) => return,
    };

    for callback in callbacks {
      callback();
    }
  }

  fn add_listener(&self, on: Transition, callback: Callback) -> u64 {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut listeners) = self.listeners.lock() {
      listeners.push(Listener { id, on, callback });
    }
    id
  }

  fn remove_listeners(&self, ids: &[u64]) {
    if let Ok(mut listeners) = self.listeners.lock() {
      listeners.retain(|l| !ids.contains(&l.id));
    }
  }

  #[cfg(test)]
  fn listener_count(&self) -> usize {
    self.listeners.lock().map(|l| l.len()).unwrap_or(0)
  }
}

/// Read-only view over [`NetworkStatus`].
#[derive(Clone)]
pub struct ConnectivityMonitor {
  status: Arc<NetworkStatus>,
}

impl ConnectivityMonitor {
  pub fn new(status: Arc<NetworkStatus>) -> Self {
    Self { status }
  }

  pub fn is_online(&self) -> bool {
    self.status.is_online()
  }

  /// Register a pair of transition callbacks.
  ///
  /// Both are removed together when the returned value is cleaned up or dropped.
  pub fn setup_online_status_listeners<On, Off>(
    &self,
    on_online: On,
    on_offline: Off,
  ) -> OnlineStatusListeners
  where
    On: Fn() + Send + Sync + 'static,
    Off: Fn() + Send + Sync + 'static,
  {
    let online = self
      .status
      .add_listener(Transition::Online, Arc::new(on_online));
    let offline = self
      .status
      .add_listener(Transition::Offline, Arc::new(on_offline));

    OnlineStatusListeners {
      status: Arc::downgrade(&self.status),
      ids: [online, offline],
    }
  }

  #[cfg(test)]
  fn listener_count(&self) -> usize {
    self.status.listener_count()
  }
}

/// Registration of an online/offline listener pair.
#[must_use = "dropping this removes the listeners"]
pub struct OnlineStatusListeners {
  status: Weak<NetworkStatus>,
  ids: [u64; 2],
}

impl OnlineStatusListeners {
  /// Remove both listeners.
  pub fn cleanup(self) {
    drop(self);
  }
}

impl Drop for OnlineStatusListeners {
  fn drop(&mut self) {
    if let Some(status) = self.status.upgrade() {
      status.remove_listeners(&self.ids);
    }
  }
}
