//! Connectivity tracking with edge-triggered notifications.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use url::Url;

/// Binary connectivity signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

impl Connectivity {
  pub fn from_online(online: bool) -> Self {
    if online {
      Connectivity::Online
    } else {
      Connectivity::Offline
    }
  }
}

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
  CameOnline,
  WentOffline,
}

/// Observes connectivity and fires once per transition.
///
/// Observers either watch the current state through [`NetworkMonitor::subscribe`]
/// or receive transitions through [`NetworkMonitor::edges`]. Dropping the
/// receiver unsubscribes.
pub struct NetworkMonitor {
  state: watch::Sender<Connectivity>,
  edges: broadcast::Sender<Edge>,
}

impl NetworkMonitor {
  pub fn new(initial: Connectivity) -> Self {
    let (state, _) = watch::channel(initial);
    let (edges, _) = broadcast::channel(16);
    Self { state, edges }
  }

  pub fn connectivity(&self) -> Connectivity {
    *self.state.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.connectivity() == Connectivity::Online
  }

  /// Report the latest observation. Returns the edge if the state changed.
  pub fn report(&self, observed: Connectivity) -> Option<Edge> {
    let mut edge = None;
    self.state.send_if_modified(|current| {
      if *current == observed {
        return false;
      }
      edge = Some(match observed {
        Connectivity::Online => Edge::CameOnline,
        Connectivity::Offline => Edge::WentOffline,
      });
      *current = observed;
      true
    });

    if let Some(edge) = edge {
      info!(?edge, "Connectivity changed");
      // No receivers is fine
      let _ = self.edges.send(edge);
    }
    edge
  }

  pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
    self.state.subscribe()
  }

  pub fn edges(&self) -> broadcast::Receiver<Edge> {
    self.edges.subscribe()
  }

  /// Poll `probe_url` and report the result every `every`.
  ///
  /// Any HTTP response counts as online; only transport failures count as
  /// offline.
  pub fn spawn_probe(
    self: &Arc<Self>,
    client: reqwest::Client,
    probe_url: Url,
    every: Duration,
  ) -> JoinHandle<()> {
    let monitor = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        ticker.tick().await;
        let observed = probe(&client, &probe_url).await;
        monitor.report(observed);
      }
    })
  }
}

/// Check reachability of `url` once.
pub async fn probe(client: &reqwest::Client, url: &Url) -> Connectivity {
  match client.head(url.clone()).send().await {
    Ok(_) => Connectivity::Online,
    Err(e) => {
      debug!(url = %url, error = %e, "Connectivity probe failed");
      Connectivity::Offline
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_transitions_fire_edges() {
    let monitor = NetworkMonitor::new(Connectivity::Offline);
    let mut edges = monitor.edges();

    assert_eq!(monitor.report(Connectivity::Offline), None);
    assert_eq!(monitor.report(Connectivity::Online), Some(Edge::CameOnline));
    assert_eq!(monitor.report(Connectivity::Online), None);
    assert_eq!(monitor.report(Connectivity::Offline), Some(Edge::WentOffline));

    assert_eq!(edges.try_recv().unwrap(), Edge::CameOnline);
    assert_eq!(edges.try_recv().unwrap(), Edge::WentOffline);
    assert!(edges.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_watchers_see_latest_state() {
    let monitor = NetworkMonitor::new(Connectivity::Offline);
    let mut state = monitor.subscribe();

    monitor.report(Connectivity::Online);
    state.changed().await.unwrap();
    assert_eq!(*state.borrow(), Connectivity::Online);
    assert!(monitor.is_online());
  }

  #[test]
  fn test_report_without_subscribers() {
    let monitor = NetworkMonitor::new(Connectivity::Online);
    assert_eq!(monitor.report(Connectivity::Offline), Some(Edge::WentOffline));
    assert!(!monitor.is_online());
  }
}
