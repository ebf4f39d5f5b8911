//! Page ↔ cache manager message protocol and conversation payload types.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tokio::sync::oneshot;
use url::Url;

/// A chat message as delivered by the live subscription.
///
/// Fields this layer does not interpret are kept in `extra` so a cached
/// snapshot reads back exactly as it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
  #[serde(rename = "_id")]
  pub id: String,
  /// Kept as the original JSON number so integers stay integers.
  #[serde(rename = "_creationTime", default = "zero")]
  pub creation_time: Number,
  #[serde(default)]
  pub sender_id: String,
  #[serde(default)]
  pub content: Vec<String>,
  #[serde(rename = "type", default)]
  pub kind: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

fn zero() -> Number {
  Number::from(0)
}

/// One rendered row of a conversation: the message plus sender display fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
  pub message: Message,
  #[serde(default)]
  pub sender_image: String,
  #[serde(default)]
  pub sender_name: String,
  #[serde(default)]
  pub is_current_user: bool,
}

/// Messages a page posts to the cache manager.
///
/// Fields are optional on the wire; the manager ignores requests that lack them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Store a conversation snapshot, replacing any earlier one
  #[serde(rename_all = "camelCase")]
  CacheMessages {
    conversation_id: Option<String>,
    messages: Option<Vec<MessageView>>,
  },
  /// Ask for the stored snapshot; answered on the reply port
  #[serde(rename_all = "camelCase")]
  GetCachedMessages { conversation_id: Option<String> },
}

/// Messages the cache manager sends to pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerMessage {
  /// Broadcast to every controlled page after a snapshot is stored
  #[serde(rename_all = "camelCase")]
  MessagesCached { conversation_id: String },
  /// Reply to `GET_CACHED_MESSAGES`; `messages` is null when nothing is stored
  #[serde(rename_all = "camelCase")]
  CachedMessages {
    conversation_id: String,
    messages: Option<Vec<MessageView>>,
  },
}

/// Private reply channel transferred along with a request.
pub type ReplyPort = oneshot::Sender<ManagerMessage>;

/// Synthetic URL a conversation snapshot is stored under.
pub fn snapshot_url(origin: &Url, conversation_id: &str) -> Result<Url> {
  let mut url = origin.clone();
  url.set_query(None);
  url.set_fragment(None);
  url
    .path_segments_mut()
    .map_err(|_| eyre!("Origin {} cannot carry a path", origin))?
    .clear()
    .extend(["offline", "conversations", conversation_id, "messages"]);
  Ok(url)
}

#[cfg(test)]
pub(crate) fn view(id: &str, is_current_user: bool) -> MessageView {
  MessageView {
    message: Message {
      id: id.to_string(),
      creation_time: Number::from(1_700_000_000_000u64),
      sender_id: if is_current_user { "me" } else { "them" }.to_string(),
      content: vec![format!("message {}", id)],
      kind: "text".to_string(),
      extra: Map::new(),
    },
    sender_image: String::new(),
    sender_name: if is_current_user { "Me" } else { "Them" }.to_string(),
    is_current_user,
  }
}
