//! The background cache manager: install/activate lifecycle, fetch
//! interception and the conversation snapshot protocol.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use super::clients::Clients;
use super::network::Network;
use super::request::{classify, Request, RequestClass};
use crate::cache::{CacheLayer, CacheStorage, Fetched, RequestKey, Response};
use crate::protocol::{snapshot_url, ClientMessage, ManagerMessage, MessageView, ReplyPort};

/// Everything a manager instance is built from.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
  /// Name of the current cache; every other cache is stale
  pub version: String,
  /// Origin whose GET requests are intercepted
  pub origin: Url,
  /// Paths pre-cached at install
  pub static_resources: Vec<String>,
  /// Path fragments marking backend requests (network-first)
  pub api_markers: Vec<String>,
  /// Document served when a page load fails offline
  pub offline_page: String,
}

/// Lifecycle of one manager instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
  Installing,
  /// Installed, not yet activated
  Waiting,
  Activating,
  Active,
}

/// Background cache manager for one cache version.
pub struct CacheManager<S: CacheStorage> {
  config: ManagerConfig,
  layer: CacheLayer<S>,
  network: Arc<dyn Network>,
  clients: Clients,
  state: Mutex<ManagerState>,
}

impl<S: CacheStorage + 'static> CacheManager<S> {
  pub fn new(config: ManagerConfig, storage: Arc<S>, network: Arc<dyn Network>) -> Self {
    let layer = CacheLayer::new(storage, config.version.clone());
    Self {
      config,
      layer,
      network,
      clients: Clients::new(),
      state: Mutex::new(ManagerState::Installing),
    }
  }

  pub fn version(&self) -> &str {
    &self.config.version
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  pub fn state(&self) -> ManagerState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(ManagerState::Installing)
  }

  fn set_state(&self, state: ManagerState) {
    if let Ok(mut current) = self.state.lock() {
      debug!(version = %self.config.version, from = ?*current, to = ?state, "manager state");
      *current = state;
    }
  }

  fn resolve(&self, path: &str) -> Result<Url> {
    self
      .config
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid resource path {}: {}", path, e))
  }

  /// Create the version's cache pre-populated with the static resources.
  ///
  /// All or nothing: the cache only comes into existence once every resource
  /// has been fetched, in a single write. An install that fails or is cut
  /// short leaves no cache behind for the version.
  pub async fn install(&self) -> Result<()> {
    self.set_state(ManagerState::Installing);

    info!(
      version = %self.config.version,
      count = self.config.static_resources.len(),
      "Caching static resources"
    );

    self.add_all().await?;

    self.set_state(ManagerState::Waiting);
    Ok(())
  }

  async fn add_all(&self) -> Result<()> {
    let requests = self
      .config
      .static_resources
      .iter()
      .map(|path| self.resolve(path).map(Request::get))
      .collect::<Result<Vec<_>>>()?;

    let responses = try_join_all(requests.iter().map(|request| async move {
      let response = self.network.fetch(request).await?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to pre-cache {}: status {}",
          request.url,
          response.status
        ));
      }
      Ok((request.key(), response))
    }))
    .await?;

    self.layer.store_all(&responses)
  }

  /// Delete every cache except the current version, then claim all pages.
  ///
  /// A cache that cannot be deleted is logged and left behind.
  pub fn activate(&self) -> Result<()> {
    self.set_state(ManagerState::Activating);
    let storage = self.layer.storage();

    for name in storage.cache_names()? {
      if name != self.config.version {
        info!(cache = %name, "Deleting old cache");
        if let Err(e) = storage.delete_cache(&name) {
          warn!(cache = %name, error = %e, "failed to delete old cache");
        }
      }
    }

    self.set_state(ManagerState::Active);
    let claimed = self.clients.claim()?;
    debug!(claimed, "claimed pages");
    Ok(())
  }

  /// Answer an intercepted request.
  pub async fn handle_fetch(&self, request: Request) -> Result<Fetched> {
    let key = request.key();
    match classify(&request, &self.config.origin, &self.config.api_markers) {
      RequestClass::Passthrough => {
        let response = self.network.fetch(&request).await?;
        Ok(Fetched::from_network(response))
      }
      RequestClass::NetworkFirst => {
        self
          .layer
          .network_first(&key, || self.network.fetch(&request))
          .await
      }
      RequestClass::CacheFirst => {
        let fallback = if request.accepts_html() {
          Some(RequestKey::get(
            self.resolve(&self.config.offline_page)?.to_string(),
          ))
        } else {
          None
        };
        self
          .layer
          .cache_first(&key, || self.network.fetch(&request), fallback.as_ref())
          .await
      }
    }
  }

  /// Handle a message posted by a page.
  ///
  /// Unrecognized or incomplete messages are ignored. A `GET_CACHED_MESSAGES`
  /// without a conversation id gets no reply; its port is dropped.
  pub fn handle_message(&self, data: Value, port: Option<ReplyPort>) {
    let message: ClientMessage = match serde_json::from_value(data) {
      Ok(message) => message,
      Err(e) => {
        debug!(error = %e, "ignoring unrecognized message");
        return;
      }
    };

    match message {
      ClientMessage::CacheMessages {
        conversation_id: Some(conversation_id),
        messages: Some(messages),
      } if !conversation_id.is_empty() => {
        if let Err(e) = self.store_snapshot(&conversation_id, &messages) {
          warn!(%conversation_id, error = %e, "failed to cache messages");
          return;
        }
        let notice = ManagerMessage::MessagesCached { conversation_id };
        match self.clients.broadcast(&notice) {
          Ok(delivered) => debug!(delivered, "announced cached messages"),
          Err(e) => warn!(error = %e, "failed to announce cached messages"),
        }
      }
      ClientMessage::CacheMessages { .. } => {
        debug!("ignoring CACHE_MESSAGES without conversation or messages");
      }
      ClientMessage::GetCachedMessages {
        conversation_id: Some(conversation_id),
      } if !conversation_id.is_empty() => {
        let messages = self.load_snapshot(&conversation_id);
        let reply = ManagerMessage::CachedMessages {
          conversation_id,
          messages,
        };
        match port {
          Some(port) => {
            if port.send(reply).is_err() {
              debug!("reply port closed before the answer arrived");
            }
          }
          None => debug!("GET_CACHED_MESSAGES without a reply port"),
        }
      }
      ClientMessage::GetCachedMessages { .. } => {
        debug!("GET_CACHED_MESSAGES without conversation id, not replying");
      }
    }
  }

  fn snapshot_key(&self, conversation_id: &str) -> Result<RequestKey> {
    let url = snapshot_url(&self.config.origin, conversation_id)?;
    Ok(RequestKey::get(url.to_string()))
  }

  /// Replace the stored snapshot for a conversation.
  fn store_snapshot(&self, conversation_id: &str, messages: &[MessageView]) -> Result<()> {
    let key = self.snapshot_key(conversation_id)?;
    let response =
      Response::json(messages).map_err(|e| eyre!("Failed to serialize messages: {}", e))?;
    self.layer.store(&key, &response)
  }

  /// Read the stored snapshot for a conversation; any failure reads as absent.
  fn load_snapshot(&self, conversation_id: &str) -> Option<Vec<MessageView>> {
    let key = match self.snapshot_key(conversation_id) {
      Ok(key) => key,
      Err(e) => {
        warn!(%conversation_id, error = %e, "cannot build snapshot key");
        return None;
      }
    };

    let entry = self.layer.lookup(&key)?;
    match serde_json::from_slice(&entry.response.body) {
      Ok(messages) => Some(messages),
      Err(e) => {
        warn!(%conversation_id, error = %e, "cached messages are unreadable");
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::protocol::view;
  use crate::testing::{manager_config, FakeNetwork, ORIGIN};
  use serde_json::json;
  use std::time::Duration;
  use tokio::sync::oneshot;

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn static_network() -> Arc<FakeNetwork> {
    let network = FakeNetwork::new();
    network.respond(&format!("{}/", ORIGIN), Response::new(200, "<html>home</html>"));
    network.respond(
      &format!("{}/offline.html", ORIGIN),
      Response::new(200, "<html>offline</html>"),
    );
    Arc::new(network)
  }

  fn manager(
    version: &str,
    storage: &Arc<SqliteStorage>,
    network: &Arc<FakeNetwork>,
  ) -> CacheManager<SqliteStorage> {
    CacheManager::new(manager_config(version), Arc::clone(storage), network.clone())
  }

  fn memory() -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::open_in_memory().unwrap())
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
  }

  #[tokio::test]
  async fn test_install_precaches_static_resources() {
    let storage = memory();
    let network = static_network();
    let manager = manager("v1", &storage, &network);

    manager.install().await.unwrap();

    assert_eq!(manager.state(), ManagerState::Waiting);
    let keys = storage.keys("v1").unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&RequestKey::get(format!("{}/offline.html", ORIGIN))));
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let storage = memory();
    let network = FakeNetwork::new();
    network.respond(&format!("{}/", ORIGIN), Response::new(200, "home"));
    let network = Arc::new(network);
    let manager = manager("v1", &storage, &network);

    assert!(manager.install().await.is_err());
    assert!(!storage.has_cache("v1").unwrap());
  }

  #[tokio::test]
  async fn test_interrupted_install_leaves_no_cache() {
    let storage = memory();
    let network = static_network();
    network.set_hanging(true);
    let manager = manager("v1", &storage, &network);

    let cut_short = tokio::time::timeout(Duration::from_millis(50), manager.install()).await;

    assert!(cut_short.is_err());
    assert!(!storage.has_cache("v1").unwrap());
    assert!(storage.cache_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_removes_old_versions_and_claims() {
    let storage = memory();
    let network = static_network();

    let old = manager("v1", &storage, &network);
    old.install().await.unwrap();
    old.activate().unwrap();

    let new = manager("v2", &storage, &network);
    let page = new.clients().connect().unwrap();
    assert!(!page.controlled);

    new.install().await.unwrap();
    assert_eq!(storage.cache_names().unwrap(), vec!["v1", "v2"]);

    new.activate().unwrap();
    assert_eq!(new.state(), ManagerState::Active);
    assert_eq!(storage.cache_names().unwrap(), vec!["v2"]);
    assert!(new.clients().is_controlled(page.id));
  }

  #[tokio::test]
  async fn test_cache_first_hit_never_touches_network() {
    let storage = memory();
    let network = static_network();
    let manager = manager("v1", &storage, &network);
    manager.install().await.unwrap();
    let calls_after_install = network.calls();

    let fetched = manager.handle_fetch(Request::get(url("/"))).await.unwrap();

    assert_eq!(fetched.source, CacheSource::Cache);
    assert_eq!(network.calls(), calls_after_install);
  }

  #[tokio::test]
  async fn test_page_load_offline_serves_fallback_document() {
    let storage = memory();
    let network = static_network();
    let manager = manager("v1", &storage, &network);
    manager.install().await.unwrap();
    network.set_offline(true);

    let page = Request::get(url("/conversations/c1")).with_accept("text/html");
    let fetched = manager.handle_fetch(page).await.unwrap();
    assert_eq!(fetched.source, CacheSource::OfflineFallback);
    assert_eq!(fetched.response.body, b"<html>offline</html>");

    let image = Request::get(url("/uploads/cat.png"));
    assert!(manager.handle_fetch(image).await.is_err());
  }

  #[tokio::test]
  async fn test_network_first_refreshes_and_falls_back() {
    let storage = memory();
    let network = static_network();
    let manager = manager("v1", &storage, &network);
    let api = url("/api/conversations/c1/messages");

    network.respond(api.as_str(), Response::new(200, "first"));
    manager.handle_fetch(Request::get(api.clone())).await.unwrap();
    settle().await;

    network.respond(api.as_str(), Response::new(200, "second"));
    let fetched = manager.handle_fetch(Request::get(api.clone())).await.unwrap();
    assert_eq!(fetched.source, CacheSource::Network);
    settle().await;

    network.set_offline(true);
    let fetched = manager.handle_fetch(Request::get(api.clone())).await.unwrap();
    assert_eq!(fetched.source, CacheSource::Offline);
    assert_eq!(fetched.response.body, b"second");
  }

  #[tokio::test]
  async fn test_passthrough_is_not_cached() {
    let storage = memory();
    let network = static_network();
    let manager = manager("v1", &storage, &network);
    let cross = Url::parse("https://cdn.example.com/lib.js").unwrap();
    network.respond(cross.as_str(), Response::new(200, "lib"));

    let fetched = manager.handle_fetch(Request::get(cross.clone())).await.unwrap();
    assert_eq!(fetched.source, CacheSource::Network);
    settle().await;

    assert!(storage.keys("v1").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_cache_then_get_messages() {
    let storage = memory();
    let network = static_network();
    let manager = manager("v1", &storage, &network);
    manager.activate().unwrap();
    let mut page = manager.clients().connect().unwrap();
    let messages = vec![view("m2", false), view("m1", true)];

    manager.handle_message(
      json!({"type": "CACHE_MESSAGES", "conversationId": "c1", "messages": messages}),
      None,
    );
    assert_eq!(
      page.messages.try_recv().unwrap(),
      ManagerMessage::MessagesCached {
        conversation_id: "c1".to_string()
      }
    );

    let (port, reply) = oneshot::channel();
    manager.handle_message(
      json!({"type": "GET_CACHED_MESSAGES", "conversationId": "c1"}),
      Some(port),
    );
    assert_eq!(
      reply.await.unwrap(),
      ManagerMessage::CachedMessages {
        conversation_id: "c1".to_string(),
        messages: Some(messages),
      }
    );
  }

  #[tokio::test]
  async fn test_snapshot_is_replaced_not_merged() {
    let storage = memory();
    let network = static_network();
    let manager = manager("v1", &storage, &network);

    manager.handle_message(
      json!({"type": "CACHE_MESSAGES", "conversationId": "c1", "messages": [view("m1", false)]}),
      None,
    );
    manager.handle_message(
      json!({"type": "CACHE_MESSAGES", "conversationId": "c1", "messages": [view("m2", false)]}),
      None,
    );

    assert_eq!(manager.load_snapshot("c1"), Some(vec![view("m2", false)]));
    assert_eq!(storage.keys("v1").unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_get_unknown_conversation_replies_null() {
    let storage = memory();
    let network = static_network();
    let manager = manager("v1", &storage, &network);

    let (port, reply) = oneshot::channel();
    manager.handle_message(
      json!({"type": "GET_CACHED_MESSAGES", "conversationId": "nope"}),
      Some(port),
    );
    assert_eq!(
      reply.await.unwrap(),
      ManagerMessage::CachedMessages {
        conversation_id: "nope".to_string(),
        messages: None,
      }
    );
  }

  #[tokio::test]
  async fn test_get_without_conversation_drops_port() {
    let storage = memory();
    let network = static_network();
    let manager = manager("v1", &storage, &network);

    let (port, reply) = oneshot::channel();
    manager.handle_message(json!({"type": "GET_CACHED_MESSAGES"}), Some(port));
    assert!(reply.await.is_err());
  }

  #[tokio::test]
  async fn test_unreadable_snapshot_reads_as_absent() {
    let storage = memory();
    let network = static_network();
    let manager = manager("v1", &storage, &network);
    let key = manager.snapshot_key("c1").unwrap();
    storage
      .put("v1", &key, &Response::new(200, "not json"))
      .unwrap();

    assert_eq!(manager.load_snapshot("c1"), None);
  }

  #[tokio::test]
  async fn test_garbage_messages_are_ignored() {
    let storage = memory();
    let network = static_network();
    let manager = manager("v1", &storage, &network);

    manager.handle_message(json!({"type": "SOMETHING_ELSE"}), None);
    manager.handle_message(json!("just a string"), None);
    manager.handle_message(
      json!({"type": "CACHE_MESSAGES", "conversationId": "", "messages": []}),
      None,
    );

    assert!(storage.keys("v1").unwrap().is_empty());
  }
}
