//! Running a cache manager and registering pages against it.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

use super::clients::ClientConnection;
use super::manager::{CacheManager, ManagerConfig};
use super::network::Network;
use super::request::Request;
use crate::cache::{CacheStorage, Fetched};
use crate::protocol::ReplyPort;

/// Events delivered to a running manager
#[derive(Debug)]
pub enum ManagerEvent {
  /// An intercepted request; answered on `respond_to`
  Fetch {
    request: Request,
    respond_to: oneshot::Sender<Result<Fetched>>,
  },
  /// A posted message, optionally carrying a reply port
  Message {
    data: Value,
    port: Option<ReplyPort>,
  },
  /// A page connecting to the manager
  Connect {
    respond_to: oneshot::Sender<Result<ClientConnection>>,
  },
}

/// Cheap, cloneable handle to a running manager.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
  tx: mpsc::UnboundedSender<ManagerEvent>,
  version: Arc<str>,
  script_url: Arc<str>,
}

impl ManagerHandle {
  pub(crate) fn new(
    tx: mpsc::UnboundedSender<ManagerEvent>,
    version: &str,
    script_url: &str,
  ) -> Self {
    Self {
      tx,
      version: Arc::from(version),
      script_url: Arc::from(script_url),
    }
  }

  /// Start the manager's event loop.
  ///
  /// Messages are handled one at a time in arrival order. Fetches run
  /// concurrently, each on its own task.
  pub fn spawn<S: CacheStorage + 'static>(manager: Arc<CacheManager<S>>, script_url: &str) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = Self::new(tx, manager.version(), script_url);

    tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        match event {
          ManagerEvent::Fetch {
            request,
            respond_to,
          } => {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
              // Ignore send errors - the page may have gone away
              let _ = respond_to.send(manager.handle_fetch(request).await);
            });
          }
          ManagerEvent::Message { data, port } => manager.handle_message(data, port),
          ManagerEvent::Connect { respond_to } => {
            let _ = respond_to.send(manager.clients().connect());
          }
        }
      }
      debug!(version = %manager.version(), "manager stopped");
    });

    handle
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn script_url(&self) -> &str {
    &self.script_url
  }

  pub fn is_running(&self) -> bool {
    !self.tx.is_closed()
  }

  /// Post a message without waiting for it to be handled.
  pub fn post_message(&self, data: Value, port: Option<ReplyPort>) -> Result<()> {
    self
      .tx
      .send(ManagerEvent::Message { data, port })
      .map_err(|_| eyre!("Cache manager is not running"))
  }

  /// Send a request through the manager.
  pub async fn fetch(&self, request: Request) -> Result<Fetched> {
    let (respond_to, response) = oneshot::channel();
    self
      .tx
      .send(ManagerEvent::Fetch {
        request,
        respond_to,
      })
      .map_err(|_| eyre!("Cache manager is not running"))?;

    response
      .await
      .map_err(|_| eyre!("Cache manager dropped the request"))?
  }

  /// Connect a page to the manager.
  pub async fn connect(&self) -> Result<ClientConnection> {
    let (respond_to, connection) = oneshot::channel();
    self
      .tx
      .send(ManagerEvent::Connect { respond_to })
      .map_err(|_| eyre!("Cache manager is not running"))?;

    connection
      .await
      .map_err(|_| eyre!("Cache manager dropped the connection"))?
  }
}

/// Installs and starts managers on behalf of pages.
pub trait Registrar: Send + Sync {
  /// Register the manager script, returning a handle to the active manager.
  fn register<'a>(&'a self, script_url: &'a str) -> BoxFuture<'a, Result<ManagerHandle>>;
}

/// Registrar running the manager in this process.
///
/// Registering the same script again returns the running manager. When the
/// configured version is already installed in storage, the manager resumes
/// without fetching the static resources again.
pub struct LocalRegistrar<S: CacheStorage> {
  config: ManagerConfig,
  storage: Arc<S>,
  network: Arc<dyn Network>,
  registration: Mutex<Option<ManagerHandle>>,
}

impl<S: CacheStorage + 'static> LocalRegistrar<S> {
  pub fn new(config: ManagerConfig, storage: Arc<S>, network: Arc<dyn Network>) -> Self {
    Self {
      config,
      storage,
      network,
      registration: Mutex::new(None),
    }
  }

  async fn start(&self, script_url: &str) -> Result<ManagerHandle> {
    let manager = Arc::new(CacheManager::new(
      self.config.clone(),
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
    ));

    if self.storage.has_cache(&self.config.version)? {
      info!(version = %self.config.version, "resuming installed cache");
    } else {
      manager.install().await?;
      debug!(version = %self.config.version, "installed, activating without waiting");
    }
    manager.activate()?;

    Ok(ManagerHandle::spawn(manager, script_url))
  }
}

impl<S: CacheStorage + 'static> Registrar for LocalRegistrar<S> {
  fn register<'a>(&'a self, script_url: &'a str) -> BoxFuture<'a, Result<ManagerHandle>> {
    Box::pin(async move {
      let script = self
        .config
        .origin
        .join(script_url)
        .map_err(|e| eyre!("Invalid manager script {}: {}", script_url, e))?;
      if script.origin() != self.config.origin.origin() {
        return Err(eyre!("Manager script {} is not on the served origin", script));
      }

      let mut registration = self.registration.lock().await;
      if let Some(handle) = registration.as_ref() {
        if handle.is_running() && handle.script_url() == script.as_str() {
          return Ok(handle.clone());
        }
      }

      let handle = self.start(script.as_str()).await?;
      *registration = Some(handle.clone());
      Ok(handle)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, RequestKey, Response, SqliteStorage};
  use crate::testing::{FakeNetwork, ORIGIN};
  use serde_json::json;
  use url::Url;

  fn setup() -> (Arc<SqliteStorage>, Arc<FakeNetwork>, LocalRegistrar<SqliteStorage>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    network.respond(&format!("{}/", ORIGIN), Response::new(200, "home"));
    let config = ManagerConfig {
      version: "v1".to_string(),
      origin: Url::parse(ORIGIN).unwrap(),
      static_resources: vec!["/".to_string()],
      api_markers: vec!["/api/".to_string()],
      offline_page: "/offline.html".to_string(),
    };
    let registrar = LocalRegistrar::new(config, Arc::clone(&storage), network.clone());
    (storage, network, registrar)
  }

  #[tokio::test]
  async fn test_register_is_idempotent() {
    let (_storage, network, registrar) = setup();

    let first = registrar.register("/custom-sw.js").await.unwrap();
    let installs = network.calls();
    let second = registrar.register("/custom-sw.js").await.unwrap();

    assert_eq!(first.version(), "v1");
    assert_eq!(second.script_url(), "https://chat.example.com/custom-sw.js");
    assert_eq!(network.calls(), installs);
  }

  #[tokio::test]
  async fn test_register_resumes_installed_version() {
    let (storage, network, registrar) = setup();
    let home = RequestKey::get(format!("{}/", ORIGIN));
    storage.put_all("v0", &[]).unwrap();
    storage
      .put_all("v1", &[(home.clone(), Response::new(200, "home"))])
      .unwrap();

    registrar.register("/custom-sw.js").await.unwrap();

    assert_eq!(network.calls(), 0);
    assert_eq!(storage.cache_names().unwrap(), vec!["v1"]);
    assert_eq!(storage.keys("v1").unwrap(), vec![home]);
  }

  #[tokio::test]
  async fn test_register_after_interrupted_install_installs_again() {
    let (storage, network, registrar) = setup();
    network.set_hanging(true);
    let interrupted = CacheManager::new(
      registrar.config.clone(),
      Arc::clone(&storage),
      network.clone(),
    );
    assert!(
      tokio::time::timeout(std::time::Duration::from_millis(50), interrupted.install())
        .await
        .is_err()
    );

    network.set_hanging(false);
    registrar.register("/custom-sw.js").await.unwrap();

    assert_eq!(
      storage.keys("v1").unwrap(),
      vec![RequestKey::get(format!("{}/", ORIGIN))]
    );
  }

  #[tokio::test]
  async fn test_register_rejects_cross_origin_script() {
    let (_storage, _network, registrar) = setup();
    assert!(registrar
      .register("https://evil.example.com/sw.js")
      .await
      .is_err());
  }

  #[tokio::test]
  async fn test_register_fails_when_install_fails() {
    let (storage, network, registrar) = setup();
    network.set_offline(true);

    assert!(registrar.register("/custom-sw.js").await.is_err());
    assert!(storage.cache_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_handle_routes_fetches_and_messages() {
    let (_storage, _network, registrar) = setup();
    let handle = registrar.register("/custom-sw.js").await.unwrap();
    let page = handle.connect().await.unwrap();
    assert!(page.controlled);

    let fetched = handle
      .fetch(Request::get(Url::parse(ORIGIN).unwrap()))
      .await
      .unwrap();
    assert_eq!(fetched.source, CacheSource::Cache);

    let (port, reply) = oneshot::channel();
    handle
      .post_message(
        json!({"type": "GET_CACHED_MESSAGES", "conversationId": "c1"}),
        Some(port),
      )
      .unwrap();
    assert!(reply.await.is_ok());
  }
}
