use std::sync::Arc;
use tabpilot_core::{Result, Session, TabId};
use tracing::debug;

use crate::kv::{self, KeyValueStore};

fn session_key(tab_id: TabId) -> String {
    format!("agentSession-{}", tab_id)
}

/// Tab to session binding, reloaded on every operation.
#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn KeyValueStore>,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn find(&self, tab_id: TabId) -> Result<Option<Session>> {
        kv::load(self.store.as_ref(), &session_key(tab_id)).await
    }

    pub async fn save(&self, session: &Session) -> Result<()> {
        debug!(tab_id = session.tab_id, session_id = %session.id, "Saving session");
        kv::save(self.store.as_ref(), &session_key(session.tab_id), session).await
    }

    pub async fn remove(&self, tab_id: TabId) -> Result<()> {
        self.store.delete(&session_key(tab_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use serde_json::json;
    use tabpilot_core::{Agent, AgentManifest};

    fn session(tab_id: TabId) -> Session {
        let manifest: AgentManifest = serde_json::from_value(json!({"id": "a", "name": "A"})).unwrap();
        Session {
            id: "s-1".into(),
            tab_id,
            agent: Agent::new("http://agent.test", manifest),
            origin_url: "https://shop.test/cart".into(),
            rule_ids: vec![3, 4],
            polling: false,
        }
    }

    #[tokio::test]
    async fn test_sessions_are_namespaced_by_tab() {
        let store = Arc::new(MemoryStore::new());
        let repo = SessionRepository::new(store.clone());
        repo.save(&session(7)).await.unwrap();

        assert!(store.get("agentSession-7").await.unwrap().is_some());
        assert_eq!(repo.find(7).await.unwrap(), Some(session(7)));
        assert!(repo.find(8).await.unwrap().is_none());

        repo.remove(7).await.unwrap();
        assert!(repo.find(7).await.unwrap().is_none());
    }
}
