//! A tiny fire-once-per-subscriber broadcaster, used for the transaction's
//! `finalize` event (spec.md §6).

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

#[derive(Default)]
pub struct FinalizeBroadcaster {
  subscribers: Mutex<Vec<Sender<()>>>,
}

impl FinalizeBroadcaster {
  pub fn new() -> Self {
    Self {
      subscribers: Mutex::new(Vec::new()),
    }
  }

  /// Register a new subscriber. The returned receiver gets exactly one
  /// message, the moment `fire()` is called.
  pub fn subscribe(&self) -> Receiver<()> {
    let (tx, rx) = bounded(1);
    self.subscribers.lock().push(tx);
    rx
  }

  /// Fire the event to every current subscriber. Best-effort: a dropped
  /// receiver is silently skipped.
  pub fn fire(&self) {
    let subscribers = self.subscribers.lock();
    for tx in subscribers.iter() {
      let _ = tx.try_send(());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fires_to_all_subscribers() {
    let bus = FinalizeBroadcaster::new();
    let a = bus.subscribe();
    let b = bus.subscribe();
    bus.fire();
    assert!(a.try_recv().is_ok());
    assert!(b.try_recv().is_ok());
  }
}
