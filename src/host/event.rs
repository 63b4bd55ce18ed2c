use std::time::Duration;
use tokio::sync::mpsc;

/// Events delivered to the worker outside of fetches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
  /// Periodic tick for connectivity probing
  Tick,
  /// Fire the sync registered under this tag
  Sync(String),
  /// Push message with an optional text payload
  Push(Option<String>),
  /// A shown notification was clicked
  NotificationClick(u64),
}

/// Event handler that merges a tick timer with events sent by the proxy
pub struct EventHandler {
  tx: mpsc::UnboundedSender<HostEvent>,
  rx: mpsc::UnboundedReceiver<HostEvent>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      loop {
        interval.tick().await;
        if tick_tx.send(HostEvent::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for the proxy and spawned tasks
  pub fn sender(&self) -> mpsc::UnboundedSender<HostEvent> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<HostEvent> {
    self.rx.recv().await
  }
}
