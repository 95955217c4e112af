//! Preview target tracking.
//!
//! The bridge relays server-ready notifications into a single current
//! preview target. The latest notification always wins.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

use crate::orchestrator::RunnerEvent;
use crate::sandbox::ServerReady;

/// Load state of the preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewStatus {
    /// No preview target.
    Empty,
    /// A target is set but not yet confirmed loaded.
    Loading,
    /// The consumer reported a successful load.
    Loaded,
    /// The consumer reported a failed load.
    Failed,
}

/// Current preview target and its load state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewState {
    pub target: Option<ServerReady>,
    pub status: PreviewStatus,
}

impl Default for PreviewState {
    fn default() -> Self {
        Self {
            target: None,
            status: PreviewStatus::Empty,
        }
    }
}

impl PreviewState {
    /// Returns the current URL, or an empty string when there is none.
    pub fn url(&self) -> &str {
        self.target.as_ref().map(|t| t.url.as_str()).unwrap_or("")
    }

    fn is_current(&self, url: &str) -> bool {
        self.target.as_ref().is_some_and(|t| t.url == url)
    }
}

/// Last-write-wins relay from server-ready notifications to the preview.
#[derive(Debug, Clone)]
pub struct PreviewBridge {
    state: Arc<watch::Sender<PreviewState>>,
}

impl Default for PreviewBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewBridge {
    /// Creates a bridge with no target.
    pub fn new() -> Self {
        let (state, _) = watch::channel(PreviewState::default());
        Self {
            state: Arc::new(state),
        }
    }

    /// Replaces the target and marks it as loading.
    pub fn publish(&self, ready: ServerReady) {
        tracing::info!(port = ready.port, url = %ready.url, "preview target updated");
        self.state.send_replace(PreviewState {
            target: Some(ready),
            status: PreviewStatus::Loading,
        });
    }

    /// Re-requests the current target.
    ///
    /// Returns the URL to reload, or `None` when there is no target.
    pub fn refresh(&self) -> Option<String> {
        let mut url = None;
        self.state.send_if_modified(|state| match &state.target {
            Some(target) => {
                url = Some(target.url.clone());
                state.status = PreviewStatus::Loading;
                true
            }
            None => false,
        });
        url
    }

    /// Records a successful load of `url`. Loads of superseded URLs are ignored.
    pub fn mark_loaded(&self, url: &str) -> bool {
        self.settle(url, PreviewStatus::Loaded)
    }

    /// Records a failed load of `url`. Loads of superseded URLs are ignored.
    pub fn mark_failed(&self, url: &str) -> bool {
        self.settle(url, PreviewStatus::Failed)
    }

    fn settle(&self, url: &str, status: PreviewStatus) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_current(url) {
                state.status = status;
                true
            } else {
                tracing::debug!(url = %url, "ignoring load result for superseded preview");
                false
            }
        })
    }

    /// Removes the target.
    pub fn clear(&self) {
        self.state.send_replace(PreviewState::default());
    }

    /// Returns a copy of the current state.
    pub fn current(&self) -> PreviewState {
        self.state.borrow().clone()
    }

    /// Returns the current URL, or an empty string when there is none.
    pub fn url(&self) -> String {
        self.state.borrow().url().to_string()
    }

    /// Watches preview changes.
    pub fn subscribe(&self) -> watch::Receiver<PreviewState> {
        self.state.subscribe()
    }

    /// Relays notifications into the bridge until the sender side closes.
    pub async fn relay(
        self,
        mut ready: broadcast::Receiver<ServerReady>,
        events: broadcast::Sender<RunnerEvent>,
    ) {
        loop {
            match ready.recv().await {
                Ok(notification) => {
                    self.publish(notification.clone());
                    let _ = events.send(RunnerEvent::PreviewReady(notification));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "preview relay lagged behind server-ready events");
                }
                Err(RecvError::Closed) => {
                    tracing::debug!("server-ready channel closed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(port: u16, url: &str) -> ServerReady {
        ServerReady {
            port,
            url: url.to_string(),
        }
    }

    #[test]
    fn publish_sets_loading_target() {
        let bridge = PreviewBridge::new();

        bridge.publish(ready(3000, "http://x/3000"));

        let state = bridge.current();
        assert_eq!(state.url(), "http://x/3000");
        assert_eq!(state.status, PreviewStatus::Loading);
    }

    #[test]
    fn later_notification_overwrites_earlier() {
        let bridge = PreviewBridge::new();
        bridge.publish(ready(3000, "http://x/3000"));
        bridge.mark_loaded("http://x/3000");

        bridge.publish(ready(3001, "http://x/3001"));

        assert_eq!(bridge.url(), "http://x/3001");
        assert_eq!(bridge.current().status, PreviewStatus::Loading);
    }

    #[test]
    fn duplicate_notification_is_idempotent() {
        let bridge = PreviewBridge::new();

        bridge.publish(ready(3000, "http://x/3000"));
        let once = bridge.current();
        bridge.publish(ready(3000, "http://x/3000"));

        assert_eq!(bridge.current(), once);
    }

    #[test]
    fn stale_load_result_is_ignored() {
        let bridge = PreviewBridge::new();
        bridge.publish(ready(3000, "http://x/3000"));
        bridge.publish(ready(3001, "http://x/3001"));

        assert!(!bridge.mark_loaded("http://x/3000"));
        assert_eq!(bridge.current().status, PreviewStatus::Loading);

        assert!(bridge.mark_failed("http://x/3001"));
        assert_eq!(bridge.current().status, PreviewStatus::Failed);
    }

    #[test]
    fn refresh_reenters_loading() {
        let bridge = PreviewBridge::new();
        assert_eq!(bridge.refresh(), None);
        assert_eq!(bridge.current().status, PreviewStatus::Empty);

        bridge.publish(ready(3000, "http://x/3000"));
        bridge.mark_loaded("http://x/3000");

        assert_eq!(bridge.refresh().as_deref(), Some("http://x/3000"));
        assert_eq!(bridge.current().status, PreviewStatus::Loading);
    }

    #[test]
    fn clear_empties_target() {
        let bridge = PreviewBridge::new();
        bridge.publish(ready(3000, "http://x/3000"));

        bridge.clear();

        assert_eq!(bridge.url(), "");
        assert_eq!(bridge.current().status, PreviewStatus::Empty);
    }

    #[tokio::test]
    async fn relay_forwards_notifications() {
        let bridge = PreviewBridge::new();
        let (ready_tx, ready_rx) = broadcast::channel(4);
        let (events_tx, mut events_rx) = broadcast::channel(4);
        let mut watcher = bridge.subscribe();

        let relay = tokio::spawn(bridge.clone().relay(ready_rx, events_tx));
        ready_tx.send(ready(5173, "http://localhost:5173/")).unwrap();

        watcher.changed().await.unwrap();
        assert_eq!(bridge.url(), "http://localhost:5173/");
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            RunnerEvent::PreviewReady(r) if r.port == 5173
        ));

        drop(ready_tx);
        relay.await.unwrap();
    }
}
