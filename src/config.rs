use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::worker::ManagerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the manager intercepts requests for
  pub origin: Url,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub bridge: BridgeConfig,
  #[serde(default)]
  pub conversation: ConversationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Name of the store for this deployment; older stores are deleted on activation
  pub version: String,
  /// Manager script identity used for registration
  pub script: String,
  pub offline_page: String,
  /// Path fragments that mark API requests (network-first)
  pub api_markers: Vec<String>,
  /// Pre-cached at install
  pub static_resources: Vec<String>,
  /// Overrides the default database location
  pub db_path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "chatrex-offline-v1".to_string(),
      script: "/custom-sw.js".to_string(),
      offline_page: "/offline.html".to_string(),
      api_markers: vec!["/api/".to_string(), "/convex/".to_string()],
      static_resources: [
        "/",
        "/manifest.json",
        "/favicon.ico",
        "/lo-chat.svg",
        "/icons/icon-192x192.png",
        "/icons/icon-512x512.png",
        "/notification.mp3",
        "/offline.html",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      db_path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
  pub reply_timeout_ms: u64,
}

impl Default for BridgeConfig {
  fn default() -> Self {
    Self {
      reply_timeout_ms: 3000,
    }
  }
}

impl BridgeConfig {
  pub fn reply_timeout(&self) -> Duration {
    Duration::from_millis(self.reply_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
  pub highlight_ms: u64,
  /// Live feed refetch interval
  pub poll_interval_ms: u64,
  /// Connectivity probe interval
  pub probe_interval_ms: u64,
  /// Messages endpoint; `{conversationId}` is replaced with the id
  pub messages_path: String,
}

impl Default for ConversationConfig {
  fn default() -> Self {
    Self {
      highlight_ms: 2000,
      poll_interval_ms: 2000,
      probe_interval_ms: 5000,
      messages_path: "/api/conversations/{conversationId}/messages".to_string(),
    }
  }
}

impl ConversationConfig {
  pub fn highlight(&self) -> Duration {
    Duration::from_millis(self.highlight_ms)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_millis(self.probe_interval_ms)
  }

  /// Messages endpoint for one conversation.
  pub fn messages_path_for(&self, conversation_id: &str) -> String {
    self
      .messages_path
      .replace("{conversationId}", conversation_id)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./chatrex.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/chatrex/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/chatrex/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("chatrex.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("chatrex").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.origin.cannot_be_a_base() {
      return Err(eyre!("origin must be an absolute http(s) URL"));
    }
    Ok(config)
  }

  /// Manager settings for the configured deployment.
  pub fn manager_config(&self) -> ManagerConfig {
    ManagerConfig {
      version: self.cache.version.clone(),
      origin: self.origin.clone(),
      static_resources: self.cache.static_resources.clone(),
      api_markers: self.cache.api_markers.clone(),
      offline_page: self.cache.offline_page.clone(),
    }
  }

  /// Absolute URL for a path on the configured origin.
  pub fn url_for(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("origin: https://chat.example.com\n").unwrap();

    assert_eq!(config.cache.version, "chatrex-offline-v1");
    assert_eq!(config.cache.script, "/custom-sw.js");
    assert_eq!(config.cache.static_resources.len(), 8);
    assert!(config.cache.static_resources.contains(&"/offline.html".to_string()));
    assert_eq!(config.bridge.reply_timeout(), Duration::from_millis(3000));
    assert_eq!(config.conversation.highlight(), Duration::from_millis(2000));
  }

  #[test]
  fn test_partial_section_keeps_other_defaults() {
    let config = Config::parse(
      "origin: https://chat.example.com\ncache:\n  version: chatrex-offline-v2\n",
    )
    .unwrap();

    assert_eq!(config.cache.version, "chatrex-offline-v2");
    assert_eq!(config.cache.offline_page, "/offline.html");
    assert_eq!(config.manager_config().version, "chatrex-offline-v2");
  }

  #[test]
  fn test_origin_is_required() {
    assert!(Config::parse("cache:\n  version: v1\n").is_err());
    assert!(Config::parse("origin: mailto:someone@example.com\n").is_err());
  }

  #[test]
  fn test_messages_path_and_urls() {
    let config = Config::parse("origin: https://chat.example.com\n").unwrap();

    assert_eq!(
      config.conversation.messages_path_for("c1"),
      "/api/conversations/c1/messages"
    );
    assert_eq!(
      config.url_for("/offline.html").unwrap().as_str(),
      "https://chat.example.com/offline.html"
    );
  }

  #[test]
  fn test_load_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chatrex.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "origin: https://chat.example.com").unwrap();
    writeln!(file, "bridge:\n  reply_timeout_ms: 500").unwrap();

    let config = Config::load(Some(&path)).unwrap();

    assert_eq!(config.bridge.reply_timeout(), Duration::from_millis(500));
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load(Some(&dir.path().join("nope.yaml"))).unwrap_err();

    assert!(err.to_string().contains("Config file not found"));
  }
}
