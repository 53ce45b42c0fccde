use anyhow::Context;
use std::collections::BTreeSet;
use std::sync::Arc;
use tabpilot_core::{Config, Paths, RequestEvent};
use tabpilot_storage::MemoryStore;
use tracing::{info, warn};

use super::host::{build_orchestrator, load_agents, StdoutMessenger};

/// One event per line; blank lines and `#` comments are skipped.
fn parse_events(content: &str) -> anyhow::Result<Vec<RequestEvent>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}: not a request event", i + 1))
        })
        .collect()
}

pub async fn run(events_path: &str, extra_agents: &[String], keep_open: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;

    let content = tokio::fs::read_to_string(events_path)
        .await
        .with_context(|| format!("reading {}", events_path))?;
    let events = parse_events(&content)?;

    let mut urls = config.agents.clone();
    urls.extend(extra_agents.iter().cloned());
    let agents = load_agents(&config, &urls).await;
    if agents.is_empty() {
        anyhow::bail!("No agents available. Pass --agent or run `tabpilot manifest <url> --add`.");
    }
    info!(agents = agents.len(), events = events.len(), "Replaying");

    let orchestrator = build_orchestrator(
        config,
        Arc::new(MemoryStore::new()),
        agents,
        StdoutMessenger::new(true),
        None,
    );

    let mut tabs = BTreeSet::new();
    for event in events {
        if tabs.insert(event.tab_id) {
            orchestrator.set_listener_active(event.tab_id, true).await?;
        }
        if let Err(e) = orchestrator.handle_request_event(event).await {
            warn!(error = %e, "Request event failed");
        }
    }

    println!();
    for tab_id in &tabs {
        match orchestrator.session(*tab_id).await? {
            Some(session) => println!(
                "tab {}: {} (session {}{})",
                tab_id,
                session.agent.name(),
                session.id,
                if session.polling { ", polling" } else { "" }
            ),
            None => println!("tab {}: no agent", tab_id),
        }
    }

    if keep_open {
        println!();
        println!("Sessions stay open. Press Ctrl-C to close them.");
        tokio::signal::ctrl_c().await?;
    }

    for tab_id in tabs {
        orchestrator.close(tab_id).await?;
    }
    orchestrator.shutdown().await;
    Ok(())
}
