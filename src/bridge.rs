//! Page-side bridge to the background cache manager.
//!
//! Every call degrades to a no-op or an empty result when no manager is
//! available; nothing here returns an error to the caller.

use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::connectivity::{ConnectivityMonitor, OnlineStatusListeners};
use crate::protocol::{ClientMessage, ManagerMessage, MessageView, ReplyPort};
use crate::worker::{ClientConnection, ManagerHandle, Registrar};

/// How long `get_cached_messages` waits for the manager by default.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(3000);

type MessageListener = Arc<dyn Fn(&ManagerMessage) + Send + Sync>;

/// A conversation id as handed over by routing: either a plain id or the
/// captured path segments of a catch-all route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationRef {
  Id(String),
  Segments(Vec<String>),
}

impl ConversationRef {
  /// The single id this reference names; empty when there is none.
  pub fn normalize(&self) -> String {
    match self {
      ConversationRef::Id(id) => id.clone(),
      ConversationRef::Segments(segments) => segments.first().cloned().unwrap_or_default(),
    }
  }
}

impl From<&str> for ConversationRef {
  fn from(id: &str) -> Self {
    ConversationRef::Id(id.to_string())
  }
}

impl From<String> for ConversationRef {
  fn from(id: String) -> Self {
    ConversationRef::Id(id)
  }
}

impl From<&String> for ConversationRef {
  fn from(id: &String) -> Self {
    ConversationRef::Id(id.clone())
  }
}

impl From<Vec<String>> for ConversationRef {
  fn from(segments: Vec<String>) -> Self {
    ConversationRef::Segments(segments)
  }
}

impl From<&[&str]> for ConversationRef {
  fn from(segments: &[&str]) -> Self {
    ConversationRef::Segments(segments.iter().map(|s| s.to_string()).collect())
  }
}

/// Client cache bridge.
pub struct CacheBridge {
  registrar: Option<Arc<dyn Registrar>>,
  controller: RwLock<Option<ManagerHandle>>,
  connectivity: ConnectivityMonitor,
  listeners: Arc<Mutex<Vec<MessageListener>>>,
  reply_timeout: Duration,
}

impl CacheBridge {
  /// Create a bridge. `registrar` is `None` when the runtime has no manager support.
  pub fn new(registrar: Option<Arc<dyn Registrar>>, connectivity: ConnectivityMonitor) -> Self {
    Self {
      registrar,
      controller: RwLock::new(None),
      connectivity,
      listeners: Arc::new(Mutex::new(Vec::new())),
      reply_timeout: DEFAULT_REPLY_TIMEOUT,
    }
  }

  pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
    self.reply_timeout = timeout;
    self
  }

  /// Whether the runtime can host a cache manager at all.
  pub fn is_service_worker_supported(&self) -> bool {
    self.registrar.is_some()
  }

  /// The manager controlling this page, if any.
  pub fn controller(&self) -> Option<ManagerHandle> {
    self
      .controller
      .read()
      .ok()
      .and_then(|c| c.as_ref().filter(|h| h.is_running()).cloned())
  }

  /// Register the manager script and become controlled by it.
  ///
  /// Returns false if unsupported or if registration fails; failures are logged.
  pub async fn register_service_worker(&self, script_url: &str) -> bool {
    let Some(registrar) = self.registrar.as_ref() else {
      info!("Service workers are not supported in this runtime");
      return false;
    };

    if self.controller().is_some() {
      return true;
    }

    let handle = match registrar.register(script_url).await {
      Ok(handle) => handle,
      Err(e) => {
        error!(error = %e, "Service worker registration failed");
        return false;
      }
    };

    let connection = match handle.connect().await {
      Ok(connection) => connection,
      Err(e) => {
        error!(error = %e, "Service worker registration failed");
        return false;
      }
    };

    let controlled = connection.controlled;
    debug!(client = connection.id, controlled, "connected to manager");
    self.forward_messages(connection);

    if controlled {
      if let Ok(mut controller) = self.controller.write() {
        *controller = Some(handle.clone());
      }
    }
    info!(
      scope = %handle.script_url(),
      version = %handle.version(),
      "Service worker registered successfully"
    );
    true
  }

  fn forward_messages(&self, mut connection: ClientConnection) {
    let listeners = Arc::clone(&self.listeners);
    tokio::spawn(async move {
      while let Some(message) = connection.messages.recv().await {
        let current: Vec<MessageListener> = match listeners.lock() {
          Ok(listeners) => listeners.clone(),
          Err(_) => break,
        };
        for listener in current {
          listener(&message);
        }
      }
    });
  }

  /// Observe messages the manager broadcasts to this page.
  pub fn setup_message_listener<F>(&self, listener: F)
  where
    F: Fn(&ManagerMessage) + Send + Sync + 'static,
  {
    if !self.is_service_worker_supported() {
      return;
    }
    if let Ok(mut listeners) = self.listeners.lock() {
      listeners.push(Arc::new(listener));
    }
  }

  fn post(&self, handle: &ManagerHandle, message: ClientMessage, port: Option<ReplyPort>) -> bool {
    let data: Value = match serde_json::to_value(&message) {
      Ok(data) => data,
      Err(e) => {
        warn!(error = %e, "failed to encode message for the manager");
        return false;
      }
    };
    match handle.post_message(data, port) {
      Ok(()) => true,
      Err(e) => {
        warn!(error = %e, "failed to post message to the manager");
        false
      }
    }
  }

  /// Hand a conversation snapshot to the manager without waiting for it.
  pub fn cache_messages(
    &self,
    conversation_id: impl Into<ConversationRef>,
    messages: &[MessageView],
  ) {
    let conversation_id = conversation_id.into().normalize();
    let Some(handle) = self.controller() else {
      debug!("Service worker not active, cannot cache messages");
      return;
    };
    if conversation_id.is_empty() {
      return;
    }

    self.post(
      &handle,
      ClientMessage::CacheMessages {
        conversation_id: Some(conversation_id),
        messages: Some(messages.to_vec()),
      },
      None,
    );
  }

  /// Fetch the stored snapshot for a conversation.
  ///
  /// Resolves to an empty list when unsupported, when nothing is stored, on
  /// an unexpected reply, or when the manager does not answer within the
  /// reply timeout.
  pub async fn get_cached_messages(
    &self,
    conversation_id: impl Into<ConversationRef>,
  ) -> Vec<MessageView> {
    let conversation_id = conversation_id.into().normalize();
    let Some(handle) = self.controller() else {
      debug!("Service worker not active, cannot retrieve cached messages");
      return Vec::new();
    };
    if conversation_id.is_empty() {
      return Vec::new();
    }

    let (port, reply) = oneshot::channel();
    let request = ClientMessage::GetCachedMessages {
      conversation_id: Some(conversation_id.clone()),
    };
    if !self.post(&handle, request, Some(port)) {
      return Vec::new();
    }

    match tokio::time::timeout(self.reply_timeout, reply).await {
      Ok(Ok(ManagerMessage::CachedMessages {
        conversation_id: replied,
        messages,
      })) if replied == conversation_id => messages.unwrap_or_default(),
      Ok(Ok(other)) => {
        debug!(?other, "unexpected reply to GET_CACHED_MESSAGES");
        Vec::new()
      }
      Ok(Err(_)) => {
        debug!(%conversation_id, "manager closed the reply port");
        Vec::new()
      }
      Err(_) => {
        warn!(
          %conversation_id,
          timeout_ms = self.reply_timeout.as_millis() as u64,
          "timed out waiting for cached messages"
        );
        Vec::new()
      }
    }
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  pub fn setup_online_status_listeners<On, Off>(
    &self,
    on_online: On,
    on_offline: Off,
  ) -> OnlineStatusListeners
  where
    On: Fn() + Send + Sync + 'static,
    Off: Fn() + Send + Sync + 'static,
  {
    self
      .connectivity
      .setup_online_status_listeners(on_online, on_offline)
  }
}
