use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tabpilot_core::{BrowserMessage, Result, TabId};
use tabpilot_storage::ListenerRepository;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Delivery of a message to a tab's UI.
#[async_trait]
pub trait TabMessenger: Send + Sync {
    async fn send(&self, tab_id: TabId, message: &BrowserMessage) -> Result<()>;
}

#[derive(Default)]
struct TabOutbox {
    buffered: Vec<BrowserMessage>,
    /// Set once this process has flushed the tab.
    flushed: bool,
}

/// Outbound UI messages, held back until the tab's listener is ready.
///
/// A message goes straight out when the persisted listener status says ready,
/// or when this process has already flushed the tab. The second check covers a
/// status write that has not landed yet. Each tab has its own lock, held while
/// delivering so a tab's messages keep their order without stalling other tabs.
pub struct Outbox {
    messenger: Arc<dyn TabMessenger>,
    listeners: ListenerRepository,
    tabs: std::sync::Mutex<HashMap<TabId, Arc<Mutex<TabOutbox>>>>,
}

impl Outbox {
    pub fn new(messenger: Arc<dyn TabMessenger>, listeners: ListenerRepository) -> Self {
        Self {
            messenger,
            listeners,
            tabs: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn tab(&self, tab_id: TabId) -> Arc<Mutex<TabOutbox>> {
        self.tabs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(tab_id)
            .or_default()
            .clone()
    }

    pub async fn send(&self, tab_id: TabId, message: BrowserMessage) -> Result<()> {
        let tab = self.tab(tab_id);
        let mut tab = tab.lock().await;
        if tab.flushed || self.listeners.is_active(tab_id).await? {
            self.deliver(tab_id, &message).await;
        } else {
            debug!(tab_id, kind = message.kind(), "Listener not ready, buffering message");
            tab.buffered.push(message);
        }
        Ok(())
    }

    /// Record the listener status. Going active flushes buffered messages in
    /// order; going inactive makes later messages buffer again.
    pub async fn set_listener_active(&self, tab_id: TabId, active: bool) -> Result<usize> {
        let tab = self.tab(tab_id);
        let mut tab = tab.lock().await;
        self.listeners.set_active(tab_id, active).await?;
        tab.flushed = active;
        if !active {
            return Ok(0);
        }
        let buffered = std::mem::take(&mut tab.buffered);
        for message in &buffered {
            self.deliver(tab_id, message).await;
        }
        Ok(buffered.len())
    }

    /// Forget the tab, discarding anything still buffered.
    pub async fn discard(&self, tab_id: TabId) -> Result<()> {
        let removed = self.tabs.lock().unwrap_or_else(|e| e.into_inner()).remove(&tab_id);
        if let Some(tab) = removed {
            let dropped = tab.lock().await.buffered.len();
            if dropped > 0 {
                debug!(tab_id, dropped, "Discarded undelivered messages");
            }
        }
        self.listeners.clear(tab_id).await
    }

    pub async fn buffered(&self, tab_id: TabId) -> usize {
        let tab = self.tabs.lock().unwrap_or_else(|e| e.into_inner()).get(&tab_id).cloned();
        match tab {
            Some(tab) => tab.lock().await.buffered.len(),
            None => 0,
        }
    }

    async fn deliver(&self, tab_id: TabId, message: &BrowserMessage) {
        if let Err(e) = self.messenger.send(tab_id, message).await {
            warn!(tab_id, kind = message.kind(), error = %e, "Failed to deliver message to tab");
        }
    }
}
