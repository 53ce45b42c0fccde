use std::sync::Arc;
use tabpilot_core::{FlowState, Result, TabId};

use crate::kv::{self, KeyValueStore};

fn flow_key(tab_id: TabId) -> String {
    format!("flow-{}", tab_id)
}

/// Flow progress per tab, so a flow outlives the page that started it.
#[derive(Clone)]
pub struct FlowStateRepository {
    store: Arc<dyn KeyValueStore>,
}

impl FlowStateRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, tab_id: TabId) -> Result<Option<FlowState>> {
        kv::load(self.store.as_ref(), &flow_key(tab_id)).await
    }

    pub async fn save(&self, tab_id: TabId, state: &FlowState) -> Result<()> {
        kv::save(self.store.as_ref(), &flow_key(tab_id), state).await
    }

    pub async fn clear(&self, tab_id: TabId) -> Result<()> {
        self.store.delete(&flow_key(tab_id)).await
    }
}
