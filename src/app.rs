use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::CacheBridge;
use crate::cache::{CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, NetworkStatus};
use crate::conversation::{ConversationController, Display};
use crate::event::{Event, EventHandler};
use crate::notify::TerminalBell;
use crate::protocol::{ManagerMessage, MessageView};
use crate::query::{LiveQuery, QueryState};
use crate::worker::{HttpNetwork, LocalRegistrar, Network, Request};

pub const OFFLINE_BANNER: &str = "You are offline. Some features may be limited.";
pub const CACHED_NOTICE: &str =
  "You're viewing cached messages. Some features may be limited while offline.";
pub const OFFLINE_EMPTY: &str = "You're offline. No cached messages available.";
pub const LOADING: &str = "Loading messages...";

const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);
const TICK_RATE: Duration = Duration::from_millis(250);

/// Process-wide wiring: storage, network, connectivity and the registered bridge.
pub struct App {
  config: Config,
  storage: Arc<SqliteStorage>,
  network: Arc<HttpNetwork>,
  status: Arc<NetworkStatus>,
  bridge: Arc<CacheBridge>,
}

impl App {
  /// Open the cache store, probe connectivity and register the manager.
  ///
  /// A failed registration is logged; the app keeps running uncached.
  pub async fn new(config: Config) -> Result<Self> {
    let storage = match config.cache.db_path.as_deref() {
      Some(path) => SqliteStorage::open_at(path)?,
      None => SqliteStorage::open_default()?,
    };
    let storage = Arc::new(storage);
    let network = Arc::new(HttpNetwork::new(NETWORK_TIMEOUT)?);

    let online = probe(network.as_ref(), &config).await;
    let status = NetworkStatus::new(online);
    info!(online, origin = %config.origin, "starting");

    let registrar = LocalRegistrar::new(
      config.manager_config(),
      Arc::clone(&storage),
      network.clone(),
    );
    let bridge = CacheBridge::new(
      Some(Arc::new(registrar)),
      ConnectivityMonitor::new(Arc::clone(&status)),
    )
    .with_reply_timeout(config.bridge.reply_timeout());

    if !bridge.register_service_worker(&config.cache.script).await {
      warn!("continuing without the cache manager");
    }

    Ok(Self {
      config,
      storage,
      network,
      status,
      bridge: Arc::new(bridge),
    })
  }

  /// Follow a conversation until ctrl-c, printing what the view would show.
  pub async fn watch(&self, conversation_id: &str) -> Result<()> {
    let mut events = EventHandler::new(TICK_RATE);
    let (controller_tx, controller_rx) = mpsc::unbounded_channel();
    events.forward_controller(controller_rx);

    let mut controller =
      ConversationController::new(Arc::clone(&self.bridge), Arc::new(TerminalBell), controller_tx)
        .with_highlight_duration(self.config.conversation.highlight());
    controller.set_conversation(Some(conversation_id.to_string()));
    info!(conversation_id = ?controller.conversation_id(), "watching");

    self.bridge.setup_message_listener(|message| {
      if let ManagerMessage::MessagesCached { conversation_id } = message {
        debug!(%conversation_id, "messages cached");
      }
    });

    let online_tx = events.sender();
    let offline_tx = events.sender();
    let listeners = self.bridge.setup_online_status_listeners(
      move || {
        let _ = online_tx.send(Event::Connectivity(true));
      },
      move || {
        let _ = offline_tx.send(Event::Connectivity(false));
      },
    );
    let prober = self.spawn_probe();

    let mut feed = self.message_feed(conversation_id)?;
    let mut screen = Screen::default();

    if controller.is_offline() {
      println!("{}", OFFLINE_BANNER);
    }

    while let Some(event) = events.next().await {
      match event {
        Event::Tick => {
          feed.tick();
          if feed.poll() {
            if let Some(messages) = feed.data() {
              controller.handle_snapshot(messages.clone());
            } else if let QueryState::Error(error) = feed.state() {
              warn!(%error, "message feed failed");
            }
          }
        }
        Event::Connectivity(true) => {
          println!("Back online.");
          controller.handle_online();
        }
        Event::Connectivity(false) => {
          println!("{}", OFFLINE_BANNER);
          controller.handle_offline();
        }
        Event::Controller(event) => controller.handle_event(event),
        Event::Quit => break,
      }

      screen.show(render(
        controller.display(),
        controller.new_message_id(),
        controller.is_offline(),
      ));
    }

    prober.abort();
    listeners.cleanup();
    Ok(())
  }

  /// Live feed of the conversation's messages, fetched through the manager
  /// when it controls this page.
  fn message_feed(&self, conversation_id: &str) -> Result<LiveQuery<Vec<MessageView>>> {
    let url = self
      .config
      .url_for(&self.config.conversation.messages_path_for(conversation_id))?;
    let manager = self.bridge.controller();
    let network = Arc::clone(&self.network);

    let feed = LiveQuery::new(move || {
      let manager = manager.clone();
      let network = Arc::clone(&network);
      let request = Request::get(url.clone()).with_accept("application/json");
      async move {
        let response = match manager {
          Some(manager) => manager.fetch(request).await.map(|fetched| fetched.response),
          None => network.fetch(&request).await,
        }
        .map_err(|e| e.to_string())?;

        if !response.is_success() {
          return Err(format!("messages request returned {}", response.status));
        }
        serde_json::from_slice::<Vec<MessageView>>(&response.body).map_err(|e| e.to_string())
      }
    })
    .with_interval(self.config.conversation.poll_interval());

    Ok(feed)
  }

  /// Periodically check reachability of the origin and update the online flag.
  fn spawn_probe(&self) -> JoinHandle<()> {
    let network = Arc::clone(&self.network);
    let status = Arc::clone(&self.status);
    let config = self.config.clone();
    let every = self.config.conversation.probe_interval();

    tokio::spawn(async move {
      let mut interval = tokio::time::interval(every);
      loop {
        interval.tick().await;
        let online = probe(network.as_ref(), &config).await;
        status.set_online(online);
      }
    })
  }

  /// One request through the manager, reporting where the answer came from.
  pub async fn fetch(&self, path: &str, html: bool) -> Result<()> {
    let manager = self
      .bridge
      .controller()
      .ok_or_else(|| eyre!("The cache manager is not running"))?;

    let mut request = Request::get(self.config.url_for(path)?);
    if html {
      request = request.with_accept("text/html");
    }
    let url = request.url.clone();
    let fetched = manager.fetch(request).await?;

    println!("{} {}", fetched.response.status, url);
    println!("source: {}", fetched.source.label());
    if let Some(content_type) = fetched.response.header("content-type") {
      println!("content-type: {}", content_type);
    }
    if let Some(cached_at) = fetched.cached_at {
      println!("cached at: {}", cached_at.to_rfc3339());
    }
    println!("{} bytes", fetched.response.body.len());
    Ok(())
  }

  /// Print the stored snapshot for a conversation.
  pub async fn messages(&self, conversation_id: &str) -> Result<()> {
    let messages = self.bridge.get_cached_messages(conversation_id).await;
    if messages.is_empty() {
      println!("No cached messages for {}", conversation_id);
      return Ok(());
    }
    for line in render_messages(&messages, None) {
      println!("{}", line);
    }
    Ok(())
  }

  /// List every store and the keys it holds.
  pub fn caches(&self) -> Result<()> {
    for name in self.storage.cache_names()? {
      let marker = if name == self.config.cache.version {
        " (current)"
      } else {
        ""
      };
      println!("{}{}", name, marker);
      for key in self.storage.keys(&name)? {
        println!("  {}", key);
      }
    }
    Ok(())
  }
}

/// Reachability check against the origin, bypassing the cache.
async fn probe(network: &dyn Network, config: &Config) -> bool {
  let request = Request::new(Method::HEAD, config.origin.clone());
  network.fetch(&request).await.is_ok()
}

/// Prints a frame only when it differs from the previous one.
#[derive(Default)]
struct Screen {
  last: Vec<String>,
}

impl Screen {
  fn show(&mut self, lines: Vec<String>) {
    if lines == self.last {
      return;
    }
    println!();
    for line in &lines {
      println!("{}", line);
    }
    self.last = lines;
  }
}

/// An offline frame with messages always leads with the cached notice.
fn render(display: Display<'_>, new_message_id: Option<&str>, offline: bool) -> Vec<String> {
  let (messages, cached) = match display {
    Display::Loading => return vec![LOADING.to_string()],
    Display::OfflineEmpty => return vec![OFFLINE_EMPTY.to_string()],
    Display::Live(messages) => (messages, false),
    Display::Cached(messages) => (messages, true),
  };

  let mut lines = Vec::with_capacity(messages.len() + 1);
  if cached || offline {
    lines.push(CACHED_NOTICE.to_string());
  }
  lines.extend(render_messages(messages, new_message_id));
  lines
}

/// Oldest first, the highlighted message marked with `*`.
fn render_messages(messages: &[MessageView], new_message_id: Option<&str>) -> Vec<String> {
  messages
    .iter()
    .rev()
    .map(|view| {
      let marker = if Some(view.message.id.as_str()) == new_message_id {
        '*'
      } else {
        ' '
      };
      let sender = if view.is_current_user {
        "You"
      } else {
        view.sender_name.as_str()
      };
      format!("{} {}: {}", marker, sender, view.message.content.join(" "))
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::view;

  #[test]
  fn test_render_states() {
    assert_eq!(render(Display::Loading, None, false), vec![LOADING]);
    assert_eq!(render(Display::OfflineEmpty, None, true), vec![OFFLINE_EMPTY]);
  }

  #[test]
  fn test_render_live_oldest_first_with_highlight() {
    let messages = vec![view("b", false), view("a", true)];

    assert_eq!(
      render(Display::Live(&messages), Some("b"), false),
      vec!["  You: message a", "* Them: message b"]
    );
  }

  #[test]
  fn test_render_cached_has_notice() {
    let messages = vec![view("a", false)];

    let lines = render(Display::Cached(&messages), None, true);

    assert_eq!(
      lines[0],
      "You're viewing cached messages. Some features may be limited while offline."
    );
    assert_eq!(lines[1], "  Them: message a");
  }

  #[test]
  fn test_render_offline_live_messages_has_notice() {
    let messages = vec![view("a", false)];

    let offline = render(Display::Live(&messages), None, true);
    let online = render(Display::Live(&messages), None, false);

    assert_eq!(offline, vec![CACHED_NOTICE, "  Them: message a"]);
    assert_eq!(online, vec!["  Them: message a"]);
  }
}
