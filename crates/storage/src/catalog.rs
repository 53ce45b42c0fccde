use async_trait::async_trait;
use tabpilot_core::{Agent, Result};
use tokio::sync::RwLock;

/// Source of known agents. Discovery and CRUD live outside this workspace.
#[async_trait]
pub trait AgentCatalog: Send + Sync {
    async fn all(&self) -> Result<Vec<Agent>>;

    async fn find(&self, agent_id: &str) -> Result<Option<Agent>> {
        Ok(self.all().await?.into_iter().find(|a| a.id() == agent_id))
    }
}

#[derive(Default)]
pub struct MemoryCatalog {
    agents: RwLock<Vec<Agent>>,
}

impl MemoryCatalog {
    pub fn new(agents: Vec<Agent>) -> Self {
        Self {
            agents: RwLock::new(agents),
        }
    }

    /// Replace an agent with the same id, or append it.
    pub async fn upsert(&self, agent: Agent) {
        let mut agents = self.agents.write().await;
        match agents.iter_mut().find(|a| a.id() == agent.id()) {
            Some(existing) => *existing = agent,
            None => agents.push(agent),
        }
    }
}

#[async_trait]
impl AgentCatalog for MemoryCatalog {
    async fn all(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.read().await.clone())
    }
}
