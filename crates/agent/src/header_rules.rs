use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tabpilot_core::{Agent, Result, TabId};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::template::solve_session_template;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeaderOp {
    pub operation: String,
    pub header: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub request_headers: Vec<RequestHeaderOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub tab_ids: Vec<TabId>,
    pub regex_filter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_types: Option<Vec<String>>,
}

/// Declarative header-injection rule in the host's network rule format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderRule {
    pub id: i64,
    pub priority: u32,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

impl HeaderRule {
    pub fn applies_to_tab(&self, tab_id: TabId) -> bool {
        self.condition.tab_ids.contains(&tab_id)
    }
}

/// The host's shared declarative rule set.
#[async_trait]
pub trait HeaderRuleHost: Send + Sync {
    async fn rules(&self) -> Result<Vec<HeaderRule>>;
    async fn update_rules(&self, remove_ids: &[i64], add: Vec<HeaderRule>) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryRuleHost {
    rules: Mutex<Vec<HeaderRule>>,
}

impl MemoryRuleHost {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HeaderRuleHost for MemoryRuleHost {
    async fn rules(&self) -> Result<Vec<HeaderRule>> {
        Ok(self.rules.lock().await.clone())
    }

    async fn update_rules(&self, remove_ids: &[i64], add: Vec<HeaderRule>) -> Result<()> {
        let mut rules = self.rules.lock().await;
        rules.retain(|r| !remove_ids.contains(&r.id));
        rules.extend(add);
        Ok(())
    }
}

/// One `modifyHeaders` rule per `addHeader` action, ids allocated from `first_id`.
pub fn build_header_rules(agent: &Agent, tab_id: TabId, session_id: &str, first_id: i64, priority: u32) -> Vec<HeaderRule> {
    let mut next_id = first_id;
    let mut out = Vec::new();
    for rule in agent.rules() {
        for header in rule.actions.iter().filter_map(|a| a.as_add_header()) {
            out.push(HeaderRule {
                id: next_id,
                priority,
                action: RuleAction {
                    kind: "modifyHeaders".to_string(),
                    request_headers: vec![RequestHeaderOp {
                        operation: "set".to_string(),
                        header: header.header.clone(),
                        value: solve_session_template(&header.value, session_id),
                    }],
                },
                condition: RuleCondition {
                    tab_ids: vec![tab_id],
                    regex_filter: rule.condition.url_regex.clone(),
                    request_methods: rule
                        .condition
                        .request_methods
                        .as_ref()
                        .map(|ms| ms.iter().map(|m| m.to_ascii_lowercase()).collect()),
                    resource_types: rule.condition.resource_types.clone(),
                },
            });
            next_id += 1;
        }
    }
    out
}

/// Installs and tears down a session's header rules on the shared host rule set.
#[derive(Clone)]
pub struct HeaderRuleManager {
    host: Arc<dyn HeaderRuleHost>,
    priority: u32,
}

impl HeaderRuleManager {
    pub fn new(host: Arc<dyn HeaderRuleHost>, priority: u32) -> Self {
        Self { host, priority }
    }

    /// Install the agent's header rules for `tab_id` and return their ids.
    /// Rules left on the tab by an earlier session are replaced in the same update.
    pub async fn install(&self, agent: &Agent, tab_id: TabId, session_id: &str) -> Result<Vec<i64>> {
        let existing = self.host.rules().await?;
        let first_id = existing.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let rules = build_header_rules(agent, tab_id, session_id, first_id, self.priority);
        if rules.is_empty() {
            return Ok(Vec::new());
        }
        let stale: Vec<i64> = existing.iter().filter(|r| r.applies_to_tab(tab_id)).map(|r| r.id).collect();
        let ids: Vec<i64> = rules.iter().map(|r| r.id).collect();
        self.host.update_rules(&stale, rules).await?;
        info!(tab_id, rule_ids = ?ids, "Installed header rules");
        Ok(ids)
    }

    /// Remove the tracked ids plus anything still tagged with the tab.
    pub async fn remove(&self, tab_id: TabId, tracked: &[i64]) -> Result<usize> {
        let existing = self.host.rules().await?;
        let mut ids: BTreeSet<i64> = tracked.iter().copied().collect();
        ids.extend(existing.iter().filter(|r| r.applies_to_tab(tab_id)).map(|r| r.id));
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = ids.into_iter().collect();
        self.host.update_rules(&ids, Vec::new()).await?;
        debug!(tab_id, rule_ids = ?ids, "Removed header rules");
        Ok(ids.len())
    }

    pub async fn count_for_tab(&self, tab_id: TabId) -> Result<usize> {
        Ok(self.host.rules().await?.iter().filter(|r| r.applies_to_tab(tab_id)).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent() -> Agent {
        let manifest = serde_json::from_value(json!({
            "id": "shop",
            "name": "Shop",
            "onHttpRequest": [
                {"condition": {"urlRegex": "login", "requestMethods": ["POST"]}, "actions": [
                    {"activate": {}},
                    {"addHeader": {"header": "X-Copilot-Session", "value": "${sessionId}"}}
                ]},
                {"condition": {"urlRegex": "api"}, "actions": [
                    {"addHeader": {"header": "X-Copilot", "value": "on"}}
                ]}
            ]
        }))
        .unwrap();
        Agent::new("http://agent.test", manifest)
    }

    #[test]
    fn test_rule_wire_shape() {
        let rules = build_header_rules(&agent(), 5, "s-1", 10, 1);
        assert_eq!(rules.len(), 2);
        assert_eq!(
            serde_json::to_value(&rules[0]).unwrap(),
            json!({
                "id": 10,
                "priority": 1,
                "action": {
                    "type": "modifyHeaders",
                    "requestHeaders": [{"operation": "set", "header": "X-Copilot-Session", "value": "s-1"}]
                },
                "condition": {"tabIds": [5], "regexFilter": "login", "requestMethods": ["post"]}
            })
        );
        assert_eq!(rules[1].id, 11);
    }

    #[tokio::test]
    async fn test_ids_allocated_above_existing_rules() {
        let host = Arc::new(MemoryRuleHost::new());
        let manager = HeaderRuleManager::new(host.clone(), 1);
        let first = manager.install(&agent(), 1, "s-1").await.unwrap();
        let second = manager.install(&agent(), 2, "s-2").await.unwrap();
        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![3, 4]);
        assert_eq!(host.rules().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_remove_also_clears_untracked_tab_rules() {
        let host = Arc::new(MemoryRuleHost::new());
        let manager = HeaderRuleManager::new(host.clone(), 1);
        manager.install(&agent(), 1, "s-1").await.unwrap();
        manager.install(&agent(), 2, "s-2").await.unwrap();

        // tracking record lost
        let removed = manager.remove(1, &[]).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(manager.count_for_tab(1).await.unwrap(), 0);
        assert_eq!(manager.count_for_tab(2).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reinstall_replaces_stale_tab_rules() {
        let host = Arc::new(MemoryRuleHost::new());
        let manager = HeaderRuleManager::new(host.clone(), 1);
        manager.install(&agent(), 1, "old").await.unwrap();
        let ids = manager.install(&agent(), 1, "new").await.unwrap();
        let rules = host.rules().await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| ids.contains(&r.id)));
        assert_eq!(rules[0].action.request_headers[0].value, "new");
    }
}
