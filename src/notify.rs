//! New-message notification side effect.

use std::io::Write;
use tracing::debug;

/// Plays the sound for an incoming message.
pub trait Notifier: Send + Sync {
  fn play_message_sound(&self);
}

/// Rings the terminal bell.
pub struct TerminalBell;

impl Notifier for TerminalBell {
  fn play_message_sound(&self) {
    let mut out = std::io::stdout();
    if let Err(e) = out.write_all(b"\x07").and_then(|_| out.flush()) {
      debug!(error = %e, "failed to ring terminal bell");
    }
  }
}
