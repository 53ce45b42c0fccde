use std::sync::Arc;
use tabpilot_core::{Result, TabId};

use crate::kv::{self, KeyValueStore};

fn listener_key(tab_id: TabId) -> String {
    format!("activeTabListener-{}", tab_id)
}

/// Whether a tab's UI listener has confirmed it is ready.
#[derive(Clone)]
pub struct ListenerRepository {
    store: Arc<dyn KeyValueStore>,
}

impl ListenerRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn is_active(&self, tab_id: TabId) -> Result<bool> {
        Ok(kv::load::<bool>(self.store.as_ref(), &listener_key(tab_id))
            .await?
            .unwrap_or(false))
    }

    pub async fn set_active(&self, tab_id: TabId, active: bool) -> Result<()> {
        kv::save(self.store.as_ref(), &listener_key(tab_id), &active).await
    }

    pub async fn clear(&self, tab_id: TabId) -> Result<()> {
        self.store.delete(&listener_key(tab_id)).await
    }
}
