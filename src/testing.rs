//! Test doubles shared by unit tests.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use url::Url;

use crate::bridge::CacheBridge;
use crate::cache::{Response, SqliteStorage};
use crate::connectivity::{ConnectivityMonitor, NetworkStatus};
use crate::notify::Notifier;
use crate::worker::{
  Clients, LocalRegistrar, ManagerConfig, ManagerEvent, ManagerHandle, Network, Registrar, Request,
};

pub const ORIGIN: &str = "https://chat.example.com";

pub fn manager_config(version: &str) -> ManagerConfig {
  ManagerConfig {
    version: version.to_string(),
    origin: Url::parse(ORIGIN).unwrap(),
    static_resources: vec!["/".to_string(), "/offline.html".to_string()],
    api_markers: vec!["/api/".to_string(), "/convex/".to_string()],
    offline_page: "/offline.html".to_string(),
  }
}

/// A bridge registered against an in-process manager over in-memory storage.
pub async fn registered_bridge(status: Arc<NetworkStatus>) -> (Arc<CacheBridge>, Arc<SqliteStorage>) {
  let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
  let network = Arc::new(FakeNetwork::new());
  network.respond(&format!("{}/", ORIGIN), Response::new(200, "home"));
  network.respond(
    &format!("{}/offline.html", ORIGIN),
    Response::new(200, "offline"),
  );

  let registrar = LocalRegistrar::new(manager_config("v1"), Arc::clone(&storage), network);
  let bridge = CacheBridge::new(
    Some(Arc::new(registrar)),
    ConnectivityMonitor::new(status),
  );
  assert!(bridge.register_service_worker("/custom-sw.js").await);
  (Arc::new(bridge), storage)
}

/// Scripted network: canned responses per URL, 404 for anything else.
#[derive(Default)]
pub struct FakeNetwork {
  responses: Mutex<HashMap<String, Response>>,
  offline: AtomicBool,
  hanging: AtomicBool,
  calls: AtomicUsize,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, response: Response) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  /// While offline every fetch fails with a transport error.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// While hanging every fetch stays pending forever.
  pub fn set_hanging(&self, hanging: bool) {
    self.hanging.store(hanging, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Network for FakeNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    Box::pin(async move {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.hanging.load(Ordering::SeqCst) {
        futures::future::pending::<()>().await;
      }
      if self.offline.load(Ordering::SeqCst) {
        return Err(eyre!("network unreachable: {}", request.url));
      }
      let responses = self.responses.lock().unwrap();
      Ok(
        responses
          .get(request.url.as_str())
          .cloned()
          .unwrap_or_else(|| Response::new(404, "not found")),
      )
    })
  }
}

/// Registrar whose manager accepts pages but never answers a request.
pub struct SilentRegistrar;

impl Registrar for SilentRegistrar {
  fn register<'a>(&'a self, script_url: &'a str) -> BoxFuture<'a, Result<ManagerHandle>> {
    Box::pin(async move {
      let (tx, mut rx) = mpsc::unbounded_channel();
      tokio::spawn(async move {
        let clients = Clients::new();
        let _ = clients.claim();
        let mut held_ports = Vec::new();
        let mut held_fetches = Vec::new();
        while let Some(event) = rx.recv().await {
          match event {
            ManagerEvent::Connect { respond_to } => {
              let _ = respond_to.send(clients.connect());
            }
            ManagerEvent::Message { port, .. } => held_ports.push(port),
            ManagerEvent::Fetch { respond_to, .. } => held_fetches.push(respond_to),
          }
        }
      });
      Ok(ManagerHandle::new(tx, "silent", script_url))
    })
  }
}

/// Registrar that always fails.
pub struct FailingRegistrar;

impl Registrar for FailingRegistrar {
  fn register<'a>(&'a self, _script_url: &'a str) -> BoxFuture<'a, Result<ManagerHandle>> {
    Box::pin(async { Err(eyre!("registration rejected")) })
  }
}

/// Counts notification sounds.
#[derive(Default)]
pub struct RecordingNotifier {
  sounds: AtomicUsize,
}

impl RecordingNotifier {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn sounds(&self) -> usize {
    self.sounds.load(Ordering::SeqCst)
  }
}

impl Notifier for RecordingNotifier {
  fn play_message_sound(&self) {
    self.sounds.fetch_add(1, Ordering::SeqCst);
  }
}
