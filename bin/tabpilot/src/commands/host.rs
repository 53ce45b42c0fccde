//! Terminal stand-ins for the browser: messages go to stdout, page steps to the log.

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use tabpilot_agent::{HeaderRuleHost, MemoryRuleHost, Orchestrator, PageDriver, Selector, TabMessenger};
use tabpilot_core::{Agent, BrowserMessage, Config, Result, TabId};
use tabpilot_protocol::{AgentClient, StaticTokenProvider};
use tabpilot_storage::{KeyValueStore, MemoryCatalog};
use tracing::{info, warn};

/// Text shown for a UI message, and whether it ends the line.
pub fn render(message: &BrowserMessage) -> (String, bool) {
    match message {
        BrowserMessage::AgentMessage {
            text,
            is_complete: false,
            ..
        } => (text.clone(), false),
        BrowserMessage::AgentMessage {
            text,
            is_success: true,
            ..
        } => (text.clone(), true),
        BrowserMessage::AgentMessage { text, .. } if text.is_empty() => {
            ("[error] the agent could not answer".to_string(), true)
        }
        BrowserMessage::AgentMessage { text, .. } => (format!("[error] {}", text), true),
        BrowserMessage::AgentActivated { agent_name, .. } => (format!("[{} activated]", agent_name), true),
        BrowserMessage::InteractionSummary { success: true, text } => (
            format!("[interaction] {}", text.as_deref().unwrap_or_default()),
            true,
        ),
        BrowserMessage::InteractionSummary { text, .. } => (
            format!("[interaction failed] {}", text.as_deref().unwrap_or("no detail")),
            true,
        ),
        BrowserMessage::ActivationFailed {
            agent_name,
            contact_email,
            detail,
        } => {
            let mut line = format!("[{} could not be activated, contact {}]", agent_name, contact_email);
            if let Some(detail) = detail {
                line.push(' ');
                line.push_str(detail);
            }
            (line, true)
        }
        other => (format!("[{}]", other.kind()), true),
    }
}

pub struct StdoutMessenger {
    show_tab: bool,
}

impl StdoutMessenger {
    pub fn new(show_tab: bool) -> Self {
        Self { show_tab }
    }
}

#[async_trait]
impl TabMessenger for StdoutMessenger {
    async fn send(&self, tab_id: TabId, message: &BrowserMessage) -> Result<()> {
        let (text, end_line) = render(message);
        let mut out = std::io::stdout().lock();
        if self.show_tab {
            write!(out, "tab {}: ", tab_id)?;
        }
        if end_line {
            writeln!(out, "{}", text)?;
        } else {
            write!(out, "{}", text)?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Page driver for a tab with no real DOM: every element exists and every
/// step is logged.
pub struct HeadlessDriver;

#[async_trait]
impl PageDriver for HeadlessDriver {
    async fn exists(&self, _tab_id: TabId, _selector: &Selector) -> Result<bool> {
        Ok(true)
    }

    async fn click(&self, tab_id: TabId, selector: &Selector) -> Result<()> {
        info!(tab_id, selector = %selector, "click");
        Ok(())
    }

    async fn fill(&self, tab_id: TabId, selector: &Selector, value: &str) -> Result<()> {
        info!(tab_id, selector = %selector, value = %value, "fill");
        Ok(())
    }

    async fn scroll_into_view(&self, tab_id: TabId, selector: &Selector) -> Result<()> {
        info!(tab_id, selector = %selector, "scroll");
        Ok(())
    }

    async fn navigate(&self, tab_id: TabId, url: &str) -> Result<()> {
        info!(tab_id, url = %url, "goto");
        Ok(())
    }
}

/// Fetch every manifest, skipping agents that cannot be reached.
pub async fn load_agents(config: &Config, urls: &[String]) -> Vec<Agent> {
    let http = tabpilot_protocol::build_http_client(config.http.proxy.as_deref(), config.http.timeout());
    let mut agents = Vec::new();
    for url in urls {
        match AgentClient::fetch_manifest(&http, url).await {
            Ok(agent) => agents.push(agent),
            Err(e) => warn!(url = %url, error = %e, "Skipping agent"),
        }
    }
    agents
}

pub fn build_orchestrator(
    config: Config,
    store: Arc<dyn KeyValueStore>,
    agents: Vec<Agent>,
    messenger: StdoutMessenger,
    token: Option<&str>,
) -> Arc<Orchestrator> {
    let rule_host: Arc<dyn HeaderRuleHost> = Arc::new(MemoryRuleHost::new());
    let mut orchestrator = Orchestrator::new(
        config,
        store,
        Arc::new(MemoryCatalog::new(agents)),
        rule_host,
        Arc::new(messenger),
        Arc::new(HeadlessDriver),
    );
    if let Some(token) = token {
        orchestrator = orchestrator.with_token_provider(Arc::new(StaticTokenProvider::new(token)));
    }
    Arc::new(orchestrator)
}
