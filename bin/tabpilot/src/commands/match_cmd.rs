use anyhow::Context;
use serde_json::{json, Value};
use tabpilot_agent::{activates_on, find_matching_actions};
use tabpilot_core::{Agent, AgentManifest, RequestEvent, RequestEventType};

/// Evaluate one request against a local manifest without contacting the agent.
pub fn run(manifest: &str, url: &str, method: &str, resource_type: &str, event: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(manifest).with_context(|| format!("reading {}", manifest))?;
    let manifest: AgentManifest =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", manifest))?;
    let agent = Agent::new("file://local", manifest);

    let mut request = RequestEvent::completed(0, url, method, resource_type);
    request.kind = parse_event(event)?;

    let report = evaluate(&agent, &request)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn parse_event(event: &str) -> anyhow::Result<RequestEventType> {
    serde_json::from_value(Value::String(event.to_string()))
        .with_context(|| format!("unknown event '{}', expected beforeRequest or completed", event))
}

fn evaluate(agent: &Agent, request: &RequestEvent) -> anyhow::Result<Value> {
    let actions = find_matching_actions(agent, request)
        .into_iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "agent": agent.id(),
        "activates": activates_on(agent, request),
        "actions": actions,
    }))
}
