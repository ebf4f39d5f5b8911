//! Pages connected to the cache manager.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::protocol::ManagerMessage;

pub type ClientId = u64;

/// A page's end of its connection to the manager.
#[derive(Debug)]
pub struct ClientConnection {
  pub id: ClientId,
  /// Whether the manager controls this page
  pub controlled: bool,
  /// Messages the manager posts to this page
  pub messages: mpsc::UnboundedReceiver<ManagerMessage>,
}

struct Client {
  tx: mpsc::UnboundedSender<ManagerMessage>,
  controlled: bool,
}

#[derive(Default)]
struct ClientsInner {
  next_id: ClientId,
  /// Set once the manager claimed its pages; later pages start controlled
  claimed: bool,
  clients: HashMap<ClientId, Client>,
}

/// Registry of pages, controlled or not.
#[derive(Default)]
pub struct Clients {
  inner: Mutex<ClientsInner>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, ClientsInner>> {
    self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Connect a new page.
  pub fn connect(&self) -> Result<ClientConnection> {
    let mut inner = self.lock()?;
    let (tx, rx) = mpsc::unbounded_channel();

    inner.next_id += 1;
    let id = inner.next_id;
    let controlled = inner.claimed;
    inner.clients.insert(id, Client { tx, controlled });

    Ok(ClientConnection {
      id,
      controlled,
      messages: rx,
    })
  }

  /// Take control of every connected page. Returns how many were claimed.
  pub fn claim(&self) -> Result<usize> {
    let mut inner = self.lock()?;
    inner.claimed = true;
    inner.clients.retain(|_, client| !client.tx.is_closed());
    for client in inner.clients.values_mut() {
      client.controlled = true;
    }
    Ok(inner.clients.len())
  }

  #[cfg(test)]
  pub fn is_controlled(&self, id: ClientId) -> bool {
    self
      .lock()
      .map(|inner| inner.clients.get(&id).is_some_and(|c| c.controlled))
      .unwrap_or(false)
  }

  /// Post a message to every controlled page. Returns how many received it.
  pub fn broadcast(&self, message: &ManagerMessage) -> Result<usize> {
    let mut inner = self.lock()?;
    inner.clients.retain(|_, client| !client.tx.is_closed());

    let delivered = inner
      .clients
      .values()
      .filter(|client| client.controlled)
      .filter(|client| client.tx.send(message.clone()).is_ok())
      .count();

    Ok(delivered)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cached(id: &str) -> ManagerMessage {
    ManagerMessage::MessagesCached {
      conversation_id: id.to_string(),
    }
  }

  #[test]
  fn test_claim_controls_existing_and_future_pages() {
    let clients = Clients::new();
    let early = clients.connect().unwrap();
    assert!(!early.controlled);

    assert_eq!(clients.claim().unwrap(), 1);
    assert!(clients.is_controlled(early.id));

    let late = clients.connect().unwrap();
    assert!(late.controlled);
    assert_ne!(early.id, late.id);
  }

  #[test]
  fn test_broadcast_reaches_only_controlled_pages() {
    let clients = Clients::new();
    let mut first = clients.connect().unwrap();
    assert_eq!(clients.broadcast(&cached("c1")).unwrap(), 0);

    clients.claim().unwrap();
    let mut second = clients.connect().unwrap();
    assert_eq!(clients.broadcast(&cached("c2")).unwrap(), 2);

    assert_eq!(first.messages.try_recv().unwrap(), cached("c2"));
    assert_eq!(second.messages.try_recv().unwrap(), cached("c2"));
    assert!(second.messages.try_recv().is_err());
  }

  #[test]
  fn test_broadcast_prunes_closed_pages() {
    let clients = Clients::new();
    clients.claim().unwrap();
    let gone = clients.connect().unwrap();
    let _kept = clients.connect().unwrap();
    drop(gone);

    assert_eq!(clients.broadcast(&cached("c1")).unwrap(), 1);
  }
}
