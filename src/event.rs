use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::conversation::ControllerEvent;

/// Application events
#[derive(Debug)]
pub enum Event {
  /// Periodic tick for feed polling and redraw
  Tick,
  /// Connectivity transition; `true` means back online
  Connectivity(bool),
  /// Background work finished inside the conversation controller
  Controller(ControllerEvent),
  /// Ctrl-C
  Quit,
}

/// Event handler that merges a tick timer, shutdown signal and events
/// posted from other tasks into one stream.
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let ticks = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      loop {
        interval.tick().await;
        if ticks.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    let quit = tx.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        debug!("received ctrl-c");
        let _ = quit.send(Event::Quit);
      }
    });

    Self { tx, rx }
  }

  /// Sender for events produced elsewhere (connectivity callbacks).
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Forward controller results into the event stream.
  pub fn forward_controller(&self, mut events: mpsc::UnboundedReceiver<ControllerEvent>) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      while let Some(event) = events.recv().await {
        if tx.send(Event::Controller(event)).is_err() {
          break;
        }
      }
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
