//! Activity tracking for idle shutdown.
//!
//! The server touches the tracker on every connection and request; the
//! supervisor asks it how long the server has been idle with no clients.

use std::{
  sync::atomic::{AtomicU64, AtomicUsize, Ordering},
  time::{Duration, SystemTime, UNIX_EPOCH},
};

fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

/// Last-activity clock plus a count of connected clients
#[derive(Debug)]
pub struct KeepAlive {
  last_activity_ms: AtomicU64,
  clients: AtomicUsize,
}

impl Default for KeepAlive {
  fn default() -> Self {
    Self::new()
  }
}

impl KeepAlive {
  pub fn new() -> Self {
    Self {
      last_activity_ms: AtomicU64::new(now_millis()),
      clients: AtomicUsize::new(0),
    }
  }

  /// Record activity now
  pub fn touch(&self) {
    self.last_activity_ms.store(now_millis(), Ordering::Relaxed);
  }

  pub fn client_connected(&self) {
    self.clients.fetch_add(1, Ordering::Relaxed);
    self.touch();
  }

  pub fn client_disconnected(&self) {
    let _ = self
      .clients
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    self.touch();
  }

  pub fn clients(&self) -> usize {
    self.clients.load(Ordering::Relaxed)
  }

  /// Time since the last recorded activity
  pub fn idle_for(&self) -> Duration {
    Duration::from_millis(now_millis().saturating_sub(self.last_activity_ms.load(Ordering::Relaxed)))
  }

  /// Idle long enough with nobody connected
  pub fn is_idle(&self, timeout: Duration) -> bool {
    self.clients() == 0 && self.idle_for() >= timeout
  }
}
