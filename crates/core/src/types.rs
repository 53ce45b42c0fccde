use serde::{Deserialize, Serialize};

/// Browser tab identifier as reported by the host.
pub type TabId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    pub text: String,
}

/// OpenID settings an agent declares when its endpoints require a bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    pub url: String,
    pub client_id: String,
    #[serde(default)]
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestAction {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActivateAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_request: Option<HttpRequestAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddHeaderAction {
    pub header: String,
    pub value: String,
}

/// Turns an intercepted request into conversational context.
///
/// With a `url` the detail is fetched from that (templated) address, otherwise
/// it is extracted from the intercepted request itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RecordInteractionAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// One declarative reaction to a matching request. Encoded externally tagged,
/// e.g. `{"addHeader": {"header": "X-Session", "value": "${sessionId}"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Activate(ActivateAction),
    AddHeader(AddHeaderAction),
    RecordInteraction(RecordInteractionAction),
}

impl Action {
    pub fn as_activate(&self) -> Option<&ActivateAction> {
        match self {
            Action::Activate(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_add_header(&self) -> Option<&AddHeaderAction> {
        match self {
            Action::AddHeader(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_record_interaction(&self) -> Option<&RecordInteractionAction> {
        match self {
            Action::RecordInteraction(a) => Some(a),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RequestEventType {
    BeforeRequest,
    #[default]
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub url_regex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_types: Option<Vec<String>>,
    /// When absent the condition only applies to completed requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<RequestEventType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub condition: Condition,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndAction {
    pub http_request: HttpRequestAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentManifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub contact_email: String,
    #[serde(default)]
    pub welcome_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Vec<Prompt>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(
        default,
        alias = "pollInteractionPeriodSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub poll_interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_session_close: Option<EndAction>,
    #[serde(default)]
    pub on_http_request: Vec<Rule>,
}

/// A remote agent: its base URL plus the manifest served from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub url: String,
    pub logo: String,
    pub manifest: AgentManifest,
}

impl Agent {
    pub fn new(url: &str, manifest: AgentManifest) -> Self {
        let url = url.trim_end_matches('/').to_string();
        Self {
            logo: format!("{}/logo.png", url),
            url,
            manifest,
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn contact_email(&self) -> &str {
        &self.manifest.contact_email
    }

    pub fn rules(&self) -> &[Rule] {
        &self.manifest.on_http_request
    }
}

/// A network request observed in a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    #[serde(rename = "type", default)]
    pub kind: RequestEventType,
    pub tab_id: TabId,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_resource_type() -> String {
    "xmlhttprequest".to_string()
}

impl RequestEvent {
    pub fn completed(tab_id: TabId, url: &str, method: &str, resource_type: &str) -> Self {
        Self {
            kind: RequestEventType::Completed,
            tab_id,
            url: url.to_string(),
            method: method.to_string(),
            resource_type: resource_type.to_string(),
            request_body: None,
            initiator: None,
        }
    }
}

/// The persisted binding between a tab and an activated agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Remote session id returned by the agent.
    pub id: String,
    pub tab_id: TabId,
    pub agent: Agent,
    pub origin_url: String,
    /// Header-injection rule ids installed for this session.
    #[serde(default)]
    pub rule_ids: Vec<i64>,
    #[serde(default)]
    pub polling: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowAction {
    Message,
    Click,
    Fill,
    Goto,
    Scroll,
    #[serde(other)]
    Unsupported,
}

impl std::fmt::Display for FlowAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlowAction::Message => "message",
            FlowAction::Click => "click",
            FlowAction::Fill => "fill",
            FlowAction::Goto => "goto",
            FlowAction::Scroll => "scroll",
            FlowAction::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    pub action: FlowAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl FlowStep {
    pub fn new(action: FlowAction, selector: Option<String>, value: Option<String>) -> Self {
        Self {
            action,
            selector,
            value,
        }
    }

    pub fn message(text: &str) -> Self {
        Self::new(FlowAction::Message, None, Some(text.to_string()))
    }
}

/// An automation script returned as part of an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Flow {
    #[serde(default)]
    pub steps: Vec<FlowStep>,
}

/// Progress of a flow, persisted per tab so it survives page navigations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    pub steps: Vec<FlowStep>,
    pub current_step_index: usize,
}
