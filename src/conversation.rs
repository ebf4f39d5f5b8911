//! Conversation view controller: chooses between live and cached data,
//! mirrors live snapshots into the cache and detects new arrivals.
//!
//! The controller is synchronous. Async work (cache reads, highlight
//! timers) runs on spawned tasks that report back through
//! [`ControllerEvent`]s, which the owner feeds to [`ConversationController::handle_event`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bridge::CacheBridge;
use crate::notify::Notifier;
use crate::protocol::MessageView;

/// How long a new message stays highlighted by default.
pub const DEFAULT_HIGHLIGHT: Duration = Duration::from_millis(2000);

/// Results of the controller's background work.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
  /// A cached snapshot finished loading
  CachedLoaded {
    conversation_id: String,
    messages: Vec<MessageView>,
  },
  /// A highlight's time is up
  HighlightExpired {
    conversation_id: String,
    message_id: String,
  },
}

/// What the view should show right now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Display<'a> {
  /// Online, nothing received yet
  Loading,
  /// Offline with nothing live and nothing cached
  OfflineEmpty,
  Live(&'a [MessageView]),
  /// Offline, showing the last cached snapshot
  Cached(&'a [MessageView]),
}

/// Reconciliation state for the active conversation.
pub struct ConversationController {
  bridge: Arc<CacheBridge>,
  notifier: Arc<dyn Notifier>,
  events: mpsc::UnboundedSender<ControllerEvent>,
  highlight_duration: Duration,

  conversation_id: Option<String>,
  /// Latest snapshot from the live subscription
  live: Option<Vec<MessageView>>,
  /// Previously seen live snapshot, for new-arrival detection
  reference: Option<Vec<MessageView>>,
  initial_load: bool,
  new_message_id: Option<String>,
  offline: bool,
  offline_messages: Option<Vec<MessageView>>,
}

impl ConversationController {
  pub fn new(
    bridge: Arc<CacheBridge>,
    notifier: Arc<dyn Notifier>,
    events: mpsc::UnboundedSender<ControllerEvent>,
  ) -> Self {
    let offline = !bridge.is_online();
    Self {
      bridge,
      notifier,
      events,
      highlight_duration: DEFAULT_HIGHLIGHT,
      conversation_id: None,
      live: None,
      reference: None,
      initial_load: true,
      new_message_id: None,
      offline,
      offline_messages: None,
    }
  }

  pub fn with_highlight_duration(mut self, duration: Duration) -> Self {
    self.highlight_duration = duration;
    self
  }

  pub fn conversation_id(&self) -> Option<&str> {
    self.conversation_id.as_deref()
  }

  pub fn is_offline(&self) -> bool {
    self.offline
  }

  /// Id of the message currently highlighted as new.
  pub fn new_message_id(&self) -> Option<&str> {
    self.new_message_id.as_deref()
  }

  /// Switch to another conversation, starting over as if freshly mounted.
  pub fn set_conversation(&mut self, conversation_id: Option<String>) {
    self.conversation_id = conversation_id.filter(|id| !id.is_empty());
    self.live = None;
    self.reference = None;
    self.initial_load = true;
    self.new_message_id = None;
    self.offline_messages = None;

    self.offline = !self.bridge.is_online();
    if self.offline {
      self.load_cached_messages();
    }
  }

  pub fn handle_offline(&mut self) {
    self.offline = true;
    self.load_cached_messages();
  }

  pub fn handle_online(&mut self) {
    self.offline = false;
    self.offline_messages = None;
  }

  fn load_cached_messages(&self) {
    let Some(conversation_id) = self.conversation_id.clone() else {
      return;
    };
    let bridge = Arc::clone(&self.bridge);
    let events = self.events.clone();

    tokio::spawn(async move {
      let messages = bridge.get_cached_messages(conversation_id.as_str()).await;
      let _ = events.send(ControllerEvent::CachedLoaded {
        conversation_id,
        messages,
      });
    });
  }

  /// Take in a snapshot from the live subscription (newest first).
  pub fn handle_snapshot(&mut self, messages: Vec<MessageView>) {
    if let Some(conversation_id) = self.conversation_id.as_deref() {
      if !messages.is_empty() && self.bridge.is_online() {
        self.bridge.cache_messages(conversation_id, &messages);
      }
    }

    self.detect_new_message(&messages);
    self.live = Some(messages);
  }

  fn detect_new_message(&mut self, messages: &[MessageView]) {
    let Some(latest) = messages.first() else {
      return;
    };

    // Pre-existing history is not news
    if self.initial_load {
      self.reference = Some(messages.to_vec());
      self.initial_load = false;
      return;
    }

    let Some(previous) = self.reference.as_ref() else {
      return;
    };
    let is_new = previous
      .first()
      .map_or(true, |newest| newest.message.id != latest.message.id);

    if is_new {
      let message_id = latest.message.id.clone();
      debug!(%message_id, "new message");
      self.new_message_id = Some(message_id.clone());
      self.schedule_highlight_clear(message_id);

      if !latest.is_current_user {
        self.notifier.play_message_sound();
      }
    }

    self.reference = Some(messages.to_vec());
  }

  fn schedule_highlight_clear(&self, message_id: String) {
    let Some(conversation_id) = self.conversation_id.clone() else {
      return;
    };
    let events = self.events.clone();
    let delay = self.highlight_duration;

    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let _ = events.send(ControllerEvent::HighlightExpired {
        conversation_id,
        message_id,
      });
    });
  }

  /// Apply the result of background work. Results for another conversation are dropped.
  pub fn handle_event(&mut self, event: ControllerEvent) {
    match event {
      ControllerEvent::CachedLoaded {
        conversation_id,
        messages,
      } => {
        if self.conversation_id.as_deref() != Some(conversation_id.as_str()) {
          return;
        }
        if self.offline && !messages.is_empty() {
          info!(%conversation_id, count = messages.len(), "showing cached messages");
          self.offline_messages = Some(messages);
        }
      }
      ControllerEvent::HighlightExpired {
        conversation_id,
        message_id,
      } => {
        if self.conversation_id.as_deref() == Some(conversation_id.as_str())
          && self.new_message_id.as_deref() == Some(message_id.as_str())
        {
          self.new_message_id = None;
        }
      }
    }
  }

  pub fn display(&self) -> Display<'_> {
    if self.offline {
      if let Some(cached) = self.offline_messages.as_deref() {
        return Display::Cached(cached);
      }
    }

    match self.live.as_deref() {
      Some(live) if !live.is_empty() => Display::Live(live),
      _ if self.offline => Display::OfflineEmpty,
      _ => Display::Loading,
    }
  }
}
