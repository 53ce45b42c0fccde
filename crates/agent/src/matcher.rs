//! Declarative request matching. Pure functions over an agent's rules.

use regex::Regex;
use tabpilot_core::{Action, Agent, Condition, RequestEvent, RequestEventType, Rule};
use tracing::warn;

/// Unanchored search, as the manifests are written against. An invalid
/// pattern never matches.
fn url_matches(pattern: &str, url: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(url),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Invalid urlRegex in agent rule");
            false
        }
    }
}

fn event_matches(condition: &Condition, event: &RequestEvent) -> bool {
    match condition.event {
        Some(kind) => kind == event.kind,
        None => event.kind == RequestEventType::Completed,
    }
}

pub fn matches(event: &RequestEvent, rule: &Rule) -> bool {
    let condition = &rule.condition;
    url_matches(&condition.url_regex, &event.url)
        && condition
            .request_methods
            .as_ref()
            .map_or(true, |methods| methods.iter().any(|m| m.eq_ignore_ascii_case(&event.method)))
        && condition
            .resource_types
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == &event.resource_type))
        && event_matches(condition, event)
}

/// The first declared rule carrying an `activate` action, if any.
pub fn find_activation_rule(agent: &Agent) -> Option<&Rule> {
    agent
        .rules()
        .iter()
        .find(|r| r.actions.iter().any(|a| a.as_activate().is_some()))
}

pub fn activates_on(agent: &Agent, event: &RequestEvent) -> bool {
    find_activation_rule(agent).is_some_and(|rule| matches(event, rule))
}

/// Actions of every matching rule, flattened in declaration order.
pub fn find_matching_actions<'a>(agent: &'a Agent, event: &RequestEvent) -> Vec<&'a Action> {
    agent
        .rules()
        .iter()
        .filter(|r| matches(event, r))
        .flat_map(|r| r.actions.iter())
        .collect()
}
