use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tabpilot_core::{
    Agent, Attachment, BrowserMessage, Config, Error, RecordInteractionAction, RequestEvent, Result,
    Session, TabId,
};
use tabpilot_protocol::{
    build_http_client, call_http_action, AgentClient, AnswerFragment, Authenticator, TokenProvider,
};
use tabpilot_scheduler::{PollJob, PollService};
use tabpilot_storage::{
    AgentCatalog, FlowStateRepository, KeyValueStore, ListenerRepository, SessionRepository,
};
use tracing::{debug, error, info, warn};

use crate::flow::{FlowExecutor, FlowReporter, PageDriver};
use crate::header_rules::{HeaderRuleHost, HeaderRuleManager};
use crate::matcher::{activates_on, find_activation_rule, find_matching_actions};
use crate::outbox::{Outbox, TabMessenger};
use crate::queue::TabQueues;
use crate::template::{solve_url_template, TemplateContext};

#[derive(Debug, Clone, PartialEq)]
pub enum ActivationOutcome {
    Activated(Session),
    /// The tab already had a session; nothing was created.
    AlreadyActive,
    /// The user was shown an activation failure and nothing was left installed.
    Failed,
}

/// Server supplied detail of a failure, if the failure came from an agent.
fn service_detail(e: &Error) -> Option<String> {
    match e {
        Error::Service(s) => s.detail.clone(),
        _ => None,
    }
}

/// Owns the tab to session bindings and routes tab events through them.
///
/// Nothing here is trusted to survive a restart except what lives in the
/// key-value store: sessions, flow progress and listener status are reloaded
/// on every operation. Queues, buffered messages and timers are rebuilt empty.
pub struct Orchestrator {
    config: Config,
    http: reqwest::Client,
    catalog: Arc<dyn AgentCatalog>,
    sessions: SessionRepository,
    flow_states: FlowStateRepository,
    rules: HeaderRuleManager,
    outbox: Arc<Outbox>,
    queues: TabQueues,
    poller: PollService,
    driver: Arc<dyn PageDriver>,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        catalog: Arc<dyn AgentCatalog>,
        rule_host: Arc<dyn HeaderRuleHost>,
        messenger: Arc<dyn TabMessenger>,
        driver: Arc<dyn PageDriver>,
    ) -> Self {
        let http = build_http_client(config.http.proxy.as_deref(), config.http.timeout());
        let listeners = ListenerRepository::new(store.clone());
        Self {
            http,
            catalog,
            sessions: SessionRepository::new(store.clone()),
            flow_states: FlowStateRepository::new(store),
            rules: HeaderRuleManager::new(rule_host, config.header_rules.priority),
            outbox: Arc::new(Outbox::new(messenger, listeners)),
            queues: TabQueues::new(),
            poller: PollService::new(),
            driver,
            tokens: None,
            config,
        }
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(provider);
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub async fn session(&self, tab_id: TabId) -> Result<Option<Session>> {
        self.sessions.find(tab_id).await
    }

    pub async fn is_polling(&self, session_id: &str) -> bool {
        self.poller.is_running(session_id).await
    }

    // ---------- entry points ----------

    /// Bind `agent` to the tab. A tab that already has a session is left alone.
    pub async fn activate(self: &Arc<Self>, agent: Agent, tab_id: TabId, url: &str) -> Result<ActivationOutcome> {
        let this = Arc::clone(self);
        let url = url.to_string();
        self.queues
            .enqueue(tab_id, async move { this.activate_now(agent, tab_id, &url).await })
            .wait()
            .await?
    }

    pub async fn deactivate(self: &Arc<Self>, tab_id: TabId) -> Result<()> {
        let this = Arc::clone(self);
        self.queues
            .enqueue(tab_id, async move { this.teardown(tab_id).await })
            .wait()
            .await?
    }

    /// Route an intercepted request through the tab's queue: record it
    /// against the live session, or activate the first agent it triggers.
    pub async fn handle_request_event(self: &Arc<Self>, event: RequestEvent) -> Result<()> {
        if self.config.is_ignored_initiator(event.initiator.as_deref()) {
            debug!(tab_id = event.tab_id, url = %event.url, "Ignoring request started by the extension");
            return Ok(());
        }
        let this = Arc::clone(self);
        let tab_id = event.tab_id;
        self.queues
            .enqueue(tab_id, async move { this.process_request(event).await })
            .wait()
            .await?
    }

    pub async fn handle_user_message(self: &Arc<Self>, tab_id: TabId, text: &str, file: Option<Attachment>) -> Result<()> {
        let this = Arc::clone(self);
        let text = text.to_string();
        self.queues
            .enqueue(tab_id, async move { this.answer(tab_id, text, file).await })
            .wait()
            .await?
    }

    /// The tab's UI listener became ready (or went away). Ready flushes
    /// buffered messages, then continues any flow a navigation interrupted.
    pub async fn set_listener_active(self: &Arc<Self>, tab_id: TabId, active: bool) -> Result<()> {
        let flushed = self.outbox.set_listener_active(tab_id, active).await?;
        debug!(tab_id, active, flushed, "Tab listener status changed");
        if !active {
            return Ok(());
        }
        let this = Arc::clone(self);
        self.queues
            .enqueue(tab_id, async move { this.resume_flow(tab_id).await })
            .wait()
            .await?
    }

    /// Decode and dispatch a message from a tab's UI. A malformed or unknown
    /// message fails this call only.
    pub async fn handle_browser_message(self: &Arc<Self>, tab_id: TabId, raw: Value) -> Result<()> {
        let message = BrowserMessage::from_json(raw).map_err(|e| {
            warn!(tab_id, error = %e, "Rejected browser message");
            e
        })?;
        match message {
            BrowserMessage::ActiveTabListener { active } => self.set_listener_active(tab_id, active).await,
            BrowserMessage::ActivateAgent { agent_id, url } => {
                let agent = self
                    .catalog
                    .find(&agent_id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
                self.activate(agent, tab_id, &url).await.map(|_| ())
            }
            BrowserMessage::DeactivateAgent => self.deactivate(tab_id).await,
            BrowserMessage::UserMessage { text, file } => self.handle_user_message(tab_id, &text, file).await,
            other => Err(Error::Validation(format!("'{}' is not an inbound message", other.kind()))),
        }
    }

    /// The tab is gone. Queued work and undelivered messages are discarded,
    /// per-tab state is cleared and the session is torn down. Work already
    /// running for the tab (an activation, say) is let finish first so that
    /// whatever it installs is torn down too. Failures are logged;
    /// bookkeeping removal never stops half way.
    pub async fn close(&self, tab_id: TabId) -> Result<()> {
        self.queues.discard(tab_id).await;
        if let Err(e) = self.outbox.discard(tab_id).await {
            warn!(tab_id, error = %e, "Failed to clear tab listener status");
        }
        if let Err(e) = self.flow_states.clear(tab_id).await {
            warn!(tab_id, error = %e, "Failed to clear flow state");
        }
        self.teardown(tab_id).await
    }

    /// Stop every poll timer, e.g. on shutdown.
    pub async fn shutdown(&self) {
        self.poller.stop_all().await;
    }

    // ---------- activation ----------

    fn authenticator(&self, agent: &Agent) -> Result<Option<Authenticator>> {
        let Some(auth) = &agent.manifest.auth else {
            return Ok(None);
        };
        let provider = self
            .tokens
            .clone()
            .ok_or_else(|| Error::Auth(format!("agent {} requires sign in but no token provider is set", agent.id())))?;
        Ok(Some(Authenticator::new(
            provider,
            auth.clone(),
            self.config.auth.refresh_threshold_secs,
        )))
    }

    async fn activate_now(&self, agent: Agent, tab_id: TabId, url: &str) -> Result<ActivationOutcome> {
        if self.sessions.find(tab_id).await?.is_some() {
            debug!(tab_id, agent_id = %agent.id(), "Tab already has a session");
            return Ok(ActivationOutcome::AlreadyActive);
        }

        match self.install_session(&agent, tab_id, url).await {
            Ok(session) => {
                info!(tab_id, agent_id = %agent.id(), session_id = %session.id, "Agent activated");
                self.outbox
                    .send(
                        tab_id,
                        BrowserMessage::AgentActivated {
                            agent_id: agent.id().to_string(),
                            agent_name: agent.name().to_string(),
                            agent_logo: agent.logo.clone(),
                        },
                    )
                    .await?;
                if !agent.manifest.welcome_message.is_empty() {
                    self.outbox
                        .send(tab_id, BrowserMessage::complete(&agent.manifest.welcome_message))
                        .await?;
                }
                Ok(ActivationOutcome::Activated(session))
            }
            Err(e) => {
                error!(
                    tab_id,
                    agent_id = %agent.id(),
                    contact_email = %agent.contact_email(),
                    error = %e,
                    "Agent activation failed"
                );
                self.outbox
                    .send(
                        tab_id,
                        BrowserMessage::ActivationFailed {
                            agent_name: agent.name().to_string(),
                            contact_email: agent.contact_email().to_string(),
                            detail: service_detail(&e),
                        },
                    )
                    .await?;
                Ok(ActivationOutcome::Failed)
            }
        }
    }

    /// Create the remote session and install everything it owns. On failure
    /// whatever was installed is removed again before the error is returned.
    async fn install_session(&self, agent: &Agent, tab_id: TabId, url: &str) -> Result<Session> {
        let auth = self.authenticator(agent)?;
        let client = AgentClient::for_agent(&self.http, agent);
        let session_id = client.create_session(&self.config.locales, auth.as_ref()).await?;

        let mut session = Session {
            id: session_id,
            tab_id,
            agent: agent.clone(),
            origin_url: url.to_string(),
            rule_ids: Vec::new(),
            polling: false,
        };

        let installed = self.install_session_parts(&mut session, &client, auth).await;
        if let Err(e) = installed {
            self.poller.stop(&session.id).await;
            if let Err(cleanup) = self.rules.remove(tab_id, &session.rule_ids).await {
                error!(tab_id, error = %cleanup, "Failed to roll back header rules");
            }
            if let Err(cleanup) = self.sessions.remove(tab_id).await {
                warn!(tab_id, error = %cleanup, "Failed to roll back session record");
            }
            return Err(e);
        }
        Ok(session)
    }

    async fn install_session_parts(
        &self,
        session: &mut Session,
        client: &AgentClient,
        auth: Option<Authenticator>,
    ) -> Result<()> {
        let activation = find_activation_rule(&session.agent)
            .and_then(|rule| rule.actions.iter().find_map(|a| a.as_activate()))
            .and_then(|a| a.http_request.clone());
        if let Some(request) = activation {
            let target = solve_url_template(
                &request.url,
                &TemplateContext {
                    base_url: &session.origin_url,
                    session_id: &session.id,
                },
            )?;
            call_http_action(&self.http, &target, request.method.as_deref()).await?;
        }

        session.rule_ids = self.rules.install(&session.agent, session.tab_id, &session.id).await?;

        if let Some(seconds) = session.agent.manifest.poll_interval_seconds.filter(|s| *s > 0) {
            let job = SessionPoll {
                tab_id: session.tab_id,
                session_id: session.id.clone(),
                client: client.clone(),
                auth,
                outbox: self.outbox.clone(),
            };
            session.polling = self
                .poller
                .start(&session.id, Duration::from_secs(seconds), Arc::new(job))
                .await;
        }

        self.sessions.save(session).await
    }

    // ---------- request events ----------

    async fn process_request(&self, event: RequestEvent) -> Result<()> {
        if let Some(session) = self.sessions.find(event.tab_id).await? {
            return self.record_interaction(&session, &event).await;
        }
        for agent in self.catalog.all().await? {
            if activates_on(&agent, &event) {
                info!(tab_id = event.tab_id, agent_id = %agent.id(), url = %event.url, "Request triggers agent activation");
                self.activate_now(agent, event.tab_id, &event.url).await?;
                break;
            }
        }
        Ok(())
    }

    async fn record_interaction(&self, session: &Session, event: &RequestEvent) -> Result<()> {
        let actions = find_matching_actions(&session.agent, event);
        let Some(action) = actions.iter().find_map(|a| a.as_record_interaction()) else {
            return Ok(());
        };

        let message = match self.summarize(session, event, action).await {
            Ok(summary) if summary.is_empty() => {
                debug!(tab_id = session.tab_id, "Empty interaction summary");
                return Ok(());
            }
            Ok(summary) => BrowserMessage::InteractionSummary {
                success: true,
                text: Some(summary),
            },
            Err(e) => {
                warn!(tab_id = session.tab_id, session_id = %session.id, error = %e, "Interaction recording failed");
                BrowserMessage::InteractionSummary {
                    success: false,
                    text: service_detail(&e),
                }
            }
        };
        self.outbox.send(session.tab_id, message).await
    }

    async fn summarize(&self, session: &Session, event: &RequestEvent, action: &RecordInteractionAction) -> Result<String> {
        let detail = match &action.url {
            Some(url) => {
                let target = solve_url_template(
                    url,
                    &TemplateContext {
                        base_url: &event.url,
                        session_id: &session.id,
                    },
                )?;
                call_http_action(&self.http, &target, action.method.as_deref()).await?
            }
            None => request_detail(event),
        };
        let auth = self.authenticator(&session.agent)?;
        let client = AgentClient::for_agent(&self.http, &session.agent);
        Ok(client.summarize_interaction(&detail, &session.id, auth.as_ref()).await?)
    }

    // ---------- conversation ----------

    fn flow_executor(&self, tab_id: TabId) -> FlowExecutor {
        FlowExecutor::new(
            tab_id,
            self.driver.clone(),
            self.flow_states.clone(),
            Arc::new(OutboxReporter {
                outbox: self.outbox.clone(),
            }),
            self.config.flow.clone(),
        )
    }

    async fn answer(&self, tab_id: TabId, text: String, file: Option<Attachment>) -> Result<()> {
        let Some(session) = self.sessions.find(tab_id).await? else {
            warn!(tab_id, "User message for a tab without a session");
            return self.outbox.send(tab_id, BrowserMessage::failure(None)).await;
        };

        match self.stream_answer(&session, text, file).await {
            Ok(()) => self.outbox.send(tab_id, BrowserMessage::complete("")).await,
            Err(e) => {
                warn!(tab_id, session_id = %session.id, error = %e, "Answer failed");
                let detail = match &e {
                    Error::FlowStep(step) => Some(step.to_string()),
                    other => service_detail(other),
                };
                self.outbox.send(tab_id, BrowserMessage::failure(detail.as_deref())).await
            }
        }
    }

    async fn stream_answer(&self, session: &Session, text: String, file: Option<Attachment>) -> Result<()> {
        let auth = self.authenticator(&session.agent)?;
        let client = AgentClient::for_agent(&self.http, &session.agent);

        let question = match file.filter(|f| !f.is_empty()) {
            Some(audio) => client.transcribe(&audio.data, &session.id, auth.as_ref()).await?,
            None => text,
        };

        let mut fragments = client.ask(&question, &session.id, auth.as_ref()).await?;
        while let Some(fragment) = fragments.next().await {
            match fragment? {
                AnswerFragment::Text(part) => {
                    self.outbox.send(session.tab_id, BrowserMessage::incomplete(&part)).await?;
                }
                AnswerFragment::Flow(flow) => {
                    info!(tab_id = session.tab_id, steps = flow.steps.len(), "Running flow from answer");
                    self.flow_executor(session.tab_id).execute(&flow).await?;
                }
            }
        }
        Ok(())
    }

    async fn resume_flow(&self, tab_id: TabId) -> Result<()> {
        match self.flow_executor(tab_id).resume().await {
            Ok(true) => self.outbox.send(tab_id, BrowserMessage::complete("")).await,
            Ok(false) => Ok(()),
            Err(e) => {
                warn!(tab_id, error = %e, "Resumed flow failed");
                let detail = match &e {
                    Error::FlowStep(step) => Some(step.to_string()),
                    other => service_detail(other),
                };
                self.outbox.send(tab_id, BrowserMessage::failure(detail.as_deref())).await
            }
        }
    }

    // ---------- teardown ----------

    /// Release everything the tab's session owns. Header rules are removed
    /// even when the session record cannot be read.
    async fn teardown(&self, tab_id: TabId) -> Result<()> {
        let session = match self.sessions.find(tab_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(tab_id, error = %e, "Could not load session for teardown");
                None
            }
        };

        if let Some(session) = &session {
            self.poller.stop(&session.id).await;
        }
        let tracked = session.as_ref().map(|s| s.rule_ids.clone()).unwrap_or_default();
        if let Err(e) = self.rules.remove(tab_id, &tracked).await {
            error!(tab_id, error = %e, "Failed to remove header rules");
        }
        if let Err(e) = self.sessions.remove(tab_id).await {
            warn!(tab_id, error = %e, "Failed to remove session record");
        }

        let Some(session) = session else {
            return Ok(());
        };
        if let Some(end) = &session.agent.manifest.on_session_close {
            let result = match solve_url_template(
                &end.http_request.url,
                &TemplateContext {
                    base_url: &session.origin_url,
                    session_id: &session.id,
                },
            ) {
                Ok(target) => call_http_action(&self.http, &target, end.http_request.method.as_deref())
                    .await
                    .map(|_| ())
                    .map_err(Error::from),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                // the tab is gone, so there is nowhere to show this
                error!(
                    tab_id,
                    session_id = %session.id,
                    contact_email = %session.agent.contact_email(),
                    error = %e,
                    "Problem closing session, contact the agent's support with the details"
                );
            }
        }
        info!(tab_id, session_id = %session.id, "Session closed");
        Ok(())
    }
}

/// Interaction detail taken from the intercepted request itself.
fn request_detail(event: &RequestEvent) -> Value {
    let body = event
        .request_body
        .as_deref()
        .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
        .unwrap_or(Value::Null);
    json!({
        "url": event.url,
        "method": event.method,
        "body": body,
    })
}

struct OutboxReporter {
    outbox: Arc<Outbox>,
}

#[async_trait]
impl FlowReporter for OutboxReporter {
    async fn report(&self, tab_id: TabId, text: &str) -> Result<()> {
        self.outbox.send(tab_id, BrowserMessage::incomplete(text)).await
    }
}

/// Periodic summary request with no specific interaction.
struct SessionPoll {
    tab_id: TabId,
    session_id: String,
    client: AgentClient,
    auth: Option<Authenticator>,
    outbox: Arc<Outbox>,
}

#[async_trait]
impl PollJob for SessionPoll {
    async fn poll(&self) -> Result<()> {
        let message = match self
            .client
            .summarize_interaction(&json!({}), &self.session_id, self.auth.as_ref())
            .await
        {
            Ok(summary) if summary.is_empty() => return Ok(()),
            Ok(summary) => BrowserMessage::InteractionSummary {
                success: true,
                text: Some(summary),
            },
            Err(e) => BrowserMessage::InteractionSummary {
                success: false,
                text: e.detail,
            },
        };
        self.outbox.send(self.tab_id, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::tests::{instant_flow_config, RecordingDriver};
    use crate::header_rules::MemoryRuleHost;
    use crate::outbox::tests::RecordingMessenger;
    use axum::extract::{Path, State};
    use axum::http::{header, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tabpilot_core::{FlowAction, FlowState, FlowStep};
    use tabpilot_storage::{MemoryCatalog, MemoryStore};

    #[derive(Clone, Default)]
    struct MockAgent {
        sessions: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        interactions: Arc<Mutex<Vec<Value>>>,
        questions: Arc<Mutex<Vec<String>>>,
    }

    async fn create_session(State(mock): State<MockAgent>) -> Json<Value> {
        let n = mock.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Json(json!({"id": format!("s-{}", n)}))
    }

    async fn ask(State(mock): State<MockAgent>, Json(body): Json<Value>) -> Response {
        let question = body["question"].as_str().unwrap_or_default().to_string();
        mock.questions.lock().unwrap().push(question.clone());
        match question.as_str() {
            "stream" => (
                [(header::CONTENT_TYPE, "text/event-stream")],
                "data: Hel\r\n\r\ndata: lo\r\n\r\n",
            )
                .into_response(),
            "flow" => Json(json!({"steps": [
                {"action": "message", "value": "Clicking"},
                {"action": "click", "selector": "#buy"}
            ]}))
            .into_response(),
            "broken flow" => Json(json!({"steps": [{"action": "click", "selector": "#gone"}]})).into_response(),
            "fail" => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"detail": "boom"}))).into_response(),
            q => Json(json!({"answer": format!("echo {}", q)})).into_response(),
        }
    }

    async fn interactions(State(mock): State<MockAgent>, Json(body): Json<Value>) -> Json<Value> {
        let url = body.get("url").and_then(|u| u.as_str()).unwrap_or_default();
        if url.ends_with("/orders/1") {
            tokio::time::sleep(Duration::from_millis(40)).await;
        } else if url.ends_with("/orders/slow") {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let summary = if body.as_object().is_some_and(|o| o.is_empty()) {
            "periodic".to_string()
        } else {
            format!("seen {}", body)
        };
        mock.interactions.lock().unwrap().push(body);
        Json(json!({"summary": summary}))
    }

    async fn spawn_agent(mock: MockAgent) -> String {
        let app = Router::new()
            .route("/sessions", post(create_session))
            .route("/sessions/:id/questions", post(ask))
            .route("/sessions/:id/interactions", post(interactions))
            .route("/sessions/:id/transcriptions", post(|| async { Json(json!({"text": "stream"})) }))
            .route("/activate", post(|| async { StatusCode::OK }))
            .route("/activate-slow", post(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                StatusCode::OK
            }))
            .route("/activate-fail", post(|| async {
                (StatusCode::FORBIDDEN, Json(json!({"detail": "activation refused"})))
            }))
            .route("/orders/:id", get(|Path(id): Path<String>| async move { Json(json!({"order": id})) }))
            .route("/close", post(|State(mock): State<MockAgent>| async move {
                mock.closes.fetch_add(1, Ordering::SeqCst);
                StatusCode::NO_CONTENT
            }))
            .route("/close-fail", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .with_state(mock);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn agent(base: &str, manifest: Value) -> Agent {
        Agent::new(base, serde_json::from_value(manifest).unwrap())
    }

    fn shop_agent(base: &str) -> Agent {
        agent(
            base,
            json!({
                "id": "shop",
                "name": "Shop Assistant",
                "contactEmail": "help@shop.test",
                "welcomeMessage": "Hi! How can I help?",
                "onSessionClose": {"httpRequest": {"url": "${origin}/close", "method": "POST"}},
                "onHttpRequest": [
                    {"condition": {"urlRegex": "/login$"}, "actions": [
                        {"activate": {"httpRequest": {"url": "${origin}/activate", "method": "POST"}}},
                        {"addHeader": {"header": "X-Session", "value": "${sessionId}"}}
                    ]},
                    {"condition": {"urlRegex": "/orders/"}, "actions": [{"recordInteraction": {}}]},
                    {"condition": {"urlRegex": "/detail/"}, "actions": [
                        {"recordInteraction": {"url": "${origin}/orders/77"}}
                    ]}
                ]
            }),
        )
    }

    struct Harness {
        orch: Arc<Orchestrator>,
        mock: MockAgent,
        base: String,
        messenger: Arc<RecordingMessenger>,
        rule_host: Arc<MemoryRuleHost>,
        driver: Arc<RecordingDriver>,
        store: Arc<MemoryStore>,
    }

    impl Harness {
        async fn new(agents: impl FnOnce(&str) -> Vec<Agent>) -> Self {
            let mock = MockAgent::default();
            let base = spawn_agent(mock.clone()).await;
            let store = Arc::new(MemoryStore::new());
            let messenger = Arc::new(RecordingMessenger::default());
            let rule_host = Arc::new(MemoryRuleHost::new());
            let driver = Arc::new(RecordingDriver::new(&["#buy", "#s1", "#s2"]));
            let config = Config {
                flow: instant_flow_config(),
                ..Config::default()
            };
            let orch = Orchestrator::new(
                config,
                store.clone(),
                Arc::new(MemoryCatalog::new(agents(&base))),
                rule_host.clone(),
                messenger.clone(),
                driver.clone(),
            );
            Self {
                orch: Arc::new(orch),
                mock,
                base,
                messenger,
                rule_host,
                driver,
                store,
            }
        }

        async fn ready(&self, tab_id: TabId) {
            self.orch.set_listener_active(tab_id, true).await.unwrap();
        }

        async fn activate(&self, tab_id: TabId) -> ActivationOutcome {
            let page = format!("{}/shop/login", self.base);
            self.orch.activate(shop_agent(&self.base), tab_id, &page).await.unwrap()
        }

        fn page(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }

        async fn tab_rules(&self, tab_id: TabId) -> usize {
            self.rule_host
                .rules()
                .await
                .unwrap()
                .iter()
                .filter(|r| r.applies_to_tab(tab_id))
                .count()
        }
    }

    #[tokio::test]
    async fn test_activation_installs_session_and_greets() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;

        let session = match h.activate(1).await {
            ActivationOutcome::Activated(s) => s,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(session.id, "s-1");
        assert_eq!(session.rule_ids.len(), 1);
        assert_eq!(h.orch.session(1).await.unwrap(), Some(session));
        assert_eq!(h.tab_rules(1).await, 1);

        let sent = h.messenger.for_tab(1);
        assert!(matches!(&sent[0], BrowserMessage::AgentActivated { agent_id, .. } if agent_id == "shop"));
        assert_eq!(sent[1], BrowserMessage::complete("Hi! How can I help?"));
    }

    #[tokio::test]
    async fn test_second_activation_is_a_no_op() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        assert!(matches!(h.activate(1).await, ActivationOutcome::Activated(_)));
        assert_eq!(h.activate(1).await, ActivationOutcome::AlreadyActive);
        assert_eq!(h.mock.sessions.load(Ordering::SeqCst), 1);
        assert_eq!(h.tab_rules(1).await, 1);
    }

    #[tokio::test]
    async fn test_failed_activation_leaves_nothing_behind() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(3).await;
        let failing = agent(
            &h.base,
            json!({
                "id": "strict",
                "name": "Strict",
                "contactEmail": "ops@strict.test",
                "pollIntervalSeconds": 60,
                "onHttpRequest": [{"condition": {"urlRegex": "login"}, "actions": [
                    {"addHeader": {"header": "X-A", "value": "1"}},
                    {"activate": {"httpRequest": {"url": "${origin}/activate-fail", "method": "POST"}}}
                ]}]
            }),
        );
        let outcome = h.orch.activate(failing, 3, &h.page("/login")).await.unwrap();
        assert_eq!(outcome, ActivationOutcome::Failed);

        assert!(h.orch.session(3).await.unwrap().is_none());
        assert_eq!(h.tab_rules(3).await, 0);
        assert!(!h.orch.is_polling("s-1").await);
        assert_eq!(
            h.messenger.for_tab(3),
            vec![BrowserMessage::ActivationFailed {
                agent_name: "Strict".into(),
                contact_email: "ops@strict.test".into(),
                detail: Some("activation refused".into()),
            }]
        );
    }

    #[tokio::test]
    async fn test_agent_requiring_auth_without_provider_fails_activation() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        let secured = agent(
            &h.base,
            json!({"id": "sec", "name": "Sec", "auth": {"url": "https://id.test", "clientId": "c"}}),
        );
        let outcome = h.orch.activate(secured, 1, &h.page("/")).await.unwrap();
        assert_eq!(outcome, ActivationOutcome::Failed);
        assert_eq!(h.mock.sessions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_traffic_activates_first_matching_agent() {
        let h = Harness::new(|base| {
            vec![
                agent(base, json!({"id": "passive", "name": "Passive", "onHttpRequest": [
                    {"condition": {"urlRegex": ".*"}, "actions": [{"recordInteraction": {}}]}
                ]})),
                shop_agent(base),
            ]
        })
        .await;
        h.ready(5).await;

        h.orch
            .handle_request_event(RequestEvent::completed(5, &h.page("/shop/login"), "GET", "xmlhttprequest"))
            .await
            .unwrap();
        let session = h.orch.session(5).await.unwrap().unwrap();
        assert_eq!(session.agent.id(), "shop");
        assert_eq!(session.origin_url, h.page("/shop/login"));
    }

    #[tokio::test]
    async fn test_agent_without_activate_action_never_activates() {
        let h = Harness::new(|base| {
            vec![agent(base, json!({"id": "passive", "name": "Passive", "onHttpRequest": [
                {"condition": {"urlRegex": ".*"}, "actions": [{"addHeader": {"header": "X", "value": "1"}}]},
                {"condition": {"urlRegex": ".*"}, "actions": [{"recordInteraction": {}}]}
            ]}))]
        })
        .await;
        for path in ["/login", "/orders/1", "/anything"] {
            h.orch
                .handle_request_event(RequestEvent::completed(2, &h.page(path), "POST", "xmlhttprequest"))
                .await
                .unwrap();
        }
        assert_eq!(h.mock.sessions.load(Ordering::SeqCst), 0);
        assert!(h.orch.session(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_extension_initiated_requests_are_ignored() {
        let h = Harness::new(|base| vec![shop_agent(base)]).await;
        let mut event = RequestEvent::completed(1, &h.page("/shop/login"), "GET", "xmlhttprequest");
        event.initiator = Some("chrome-extension://abcdef".into());
        h.orch.handle_request_event(event).await.unwrap();
        assert_eq!(h.mock.sessions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_events_are_processed_in_arrival_order() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        h.activate(1).await;

        let events: Vec<_> = (1..=3)
            .map(|n| {
                let mut ev = RequestEvent::completed(1, &h.page(&format!("/orders/{}", n)), "POST", "xmlhttprequest");
                ev.request_body = Some(format!("{{\"n\": {}}}", n));
                h.orch.handle_request_event(ev)
            })
            .collect();
        for result in futures::future::join_all(events).await {
            result.unwrap();
        }

        let seen: Vec<Value> = h.mock.interactions.lock().unwrap().iter().map(|d| d["body"]["n"].clone()).collect();
        assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);
        let summaries = h
            .messenger
            .for_tab(1)
            .into_iter()
            .filter(|m| matches!(m, BrowserMessage::InteractionSummary { success: true, .. }))
            .count();
        assert_eq!(summaries, 3);
    }

    #[tokio::test]
    async fn test_interaction_detail_fetched_from_templated_url() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        h.activate(1).await;
        h.orch
            .handle_request_event(RequestEvent::completed(1, &h.page("/detail/9"), "GET", "xmlhttprequest"))
            .await
            .unwrap();
        assert_eq!(*h.mock.interactions.lock().unwrap(), vec![json!({"order": "77"})]);
    }

    #[tokio::test]
    async fn test_user_message_json_and_streamed_answers() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        h.activate(1).await;
        let before = h.messenger.for_tab(1).len();

        h.orch.handle_user_message(1, "hi", None).await.unwrap();
        h.orch.handle_user_message(1, "stream", None).await.unwrap();
        h.orch.handle_user_message(1, "fail", None).await.unwrap();

        assert_eq!(
            h.messenger.for_tab(1)[before..].to_vec(),
            vec![
                BrowserMessage::incomplete("echo hi"),
                BrowserMessage::complete(""),
                BrowserMessage::incomplete("Hel"),
                BrowserMessage::incomplete("lo"),
                BrowserMessage::complete(""),
                BrowserMessage::failure(Some("boom")),
            ]
        );
    }

    #[tokio::test]
    async fn test_audio_is_transcribed_before_asking() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        h.activate(1).await;
        let audio = Attachment {
            data: "UklGRg==".into(),
            mime: Some("audio/webm".into()),
        };
        h.orch.handle_user_message(1, "", Some(audio)).await.unwrap();
        assert_eq!(*h.mock.questions.lock().unwrap(), vec!["stream"]);
    }

    #[tokio::test]
    async fn test_flow_answer_runs_steps() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        h.activate(1).await;
        let before = h.messenger.for_tab(1).len();

        h.orch.handle_user_message(1, "flow", None).await.unwrap();
        assert_eq!(h.driver.names(), vec!["click #buy"]);
        assert_eq!(
            h.messenger.for_tab(1)[before..].to_vec(),
            vec![BrowserMessage::incomplete("Clicking"), BrowserMessage::complete("")]
        );

        h.orch.handle_user_message(1, "broken flow", None).await.unwrap();
        let last = h.messenger.for_tab(1).pop().unwrap();
        assert_eq!(
            last,
            BrowserMessage::failure(Some("Flow step 'click' failed: MissingElement"))
        );
        assert!(h.orch.flow_states.load(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listener_ready_resumes_interrupted_flow() {
        let h = Harness::new(|_| vec![]).await;
        let click = |s: &str| FlowStep::new(FlowAction::Click, Some(s.into()), None);
        FlowStateRepository::new(h.store.clone())
            .save(
                8,
                &FlowState {
                    steps: vec![click("#s0"), click("#s1"), click("#s2")],
                    current_step_index: 1,
                },
            )
            .await
            .unwrap();

        h.orch
            .handle_browser_message(8, json!({"type": "activeTabListener", "active": true}))
            .await
            .unwrap();
        assert_eq!(h.driver.names(), vec!["click #s1", "click #s2"]);
        assert_eq!(h.messenger.for_tab(8), vec![BrowserMessage::complete("")]);
    }

    #[tokio::test]
    async fn test_messages_wait_for_listener() {
        let h = Harness::new(|_| vec![]).await;
        h.activate(4).await;
        assert!(h.messenger.for_tab(4).is_empty());
        h.ready(4).await;
        assert_eq!(h.messenger.for_tab(4).len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_message_fails_only_that_call() {
        let h = Harness::new(|base| vec![shop_agent(base)]).await;
        let err = h
            .orch
            .handle_browser_message(1, json!({"type": "resizeSidebar", "delta": 4}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownMessageType(_)));

        h.orch
            .handle_browser_message(1, json!({"type": "activateAgent", "agentId": "shop", "url": h.page("/login")}))
            .await
            .unwrap();
        assert!(h.orch.session(1).await.unwrap().is_some());

        let err = h
            .orch
            .handle_browser_message(1, json!({"type": "activateAgent", "agentId": "ghost", "url": h.page("/")}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_close_removes_rules_even_when_close_action_fails() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        let flaky = agent(
            &h.base,
            json!({
                "id": "flaky",
                "name": "Flaky",
                "onSessionClose": {"httpRequest": {"url": "${origin}/close-fail", "method": "POST"}},
                "onHttpRequest": [{"condition": {"urlRegex": "login"}, "actions": [
                    {"activate": {}},
                    {"addHeader": {"header": "X-A", "value": "1"}},
                    {"addHeader": {"header": "X-B", "value": "2"}}
                ]}]
            }),
        );
        h.orch.activate(flaky, 1, &h.page("/login")).await.unwrap();
        assert_eq!(h.tab_rules(1).await, 2);

        h.orch.close(1).await.unwrap();
        assert_eq!(h.tab_rules(1).await, 0);
        assert!(h.orch.session(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_runs_close_action_and_clears_tab_state() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        h.activate(1).await;
        h.orch.close(1).await.unwrap();

        assert_eq!(h.mock.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.tab_rules(1).await, 0);
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_without_session_record_still_clears_tab_rules() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        h.activate(1).await;
        // session record lost, rules still tagged with the tab
        SessionRepository::new(h.store.clone()).remove(1).await.unwrap();
        h.orch.close(1).await.unwrap();
        assert_eq!(h.tab_rules(1).await, 0);
        assert_eq!(h.mock.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_during_activation_tears_down_what_it_installed() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        let slow = agent(
            &h.base,
            json!({
                "id": "slow",
                "name": "Slow",
                "pollIntervalSeconds": 1,
                "onSessionClose": {"httpRequest": {"url": "${origin}/close", "method": "POST"}},
                "onHttpRequest": [{"condition": {"urlRegex": "login"}, "actions": [
                    {"activate": {"httpRequest": {"url": "${origin}/activate-slow", "method": "POST"}}},
                    {"addHeader": {"header": "X-Session", "value": "${sessionId}"}}
                ]}]
            }),
        );
        let orch = h.orch.clone();
        let page = h.page("/login");
        let activation = tokio::spawn(async move { orch.activate(slow, 1, &page).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        h.orch.close(1).await.unwrap();

        let outcome = activation.await.unwrap().unwrap();
        assert!(matches!(outcome, ActivationOutcome::Activated(_)));
        assert_eq!(h.tab_rules(1).await, 0);
        assert!(h.orch.session(1).await.unwrap().is_none());
        assert!(!h.orch.is_polling("s-1").await);
        assert_eq!(h.mock.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_drops_request_events_still_queued() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        h.activate(1).await;

        let spawn_event = |path: &str| {
            let orch = h.orch.clone();
            let event = RequestEvent::completed(1, &h.page(path), "POST", "xmlhttprequest");
            tokio::spawn(async move { orch.handle_request_event(event).await })
        };
        let running = spawn_event("/orders/slow");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let queued = vec![spawn_event("/orders/2"), spawn_event("/orders/3")];
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.orch.close(1).await.unwrap();

        running.await.unwrap().unwrap();
        for job in queued {
            assert!(job.await.unwrap().is_err());
        }
        let seen: Vec<String> = h
            .mock
            .interactions
            .lock()
            .unwrap()
            .iter()
            .map(|d| d["url"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(seen, vec![h.page("/orders/slow")]);
        assert!(h.orch.session(1).await.unwrap().is_none());
        assert_eq!(h.tab_rules(1).await, 0);
    }

    #[tokio::test]
    async fn test_deactivate_waits_behind_running_activation() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        let slow = agent(
            &h.base,
            json!({"id": "slow", "name": "Slow", "onHttpRequest": [
                {"condition": {"urlRegex": "login"}, "actions": [
                    {"activate": {"httpRequest": {"url": "${origin}/activate-slow", "method": "POST"}}},
                    {"addHeader": {"header": "X-A", "value": "1"}}
                ]}
            ]}),
        );
        let orch = h.orch.clone();
        let page = h.page("/login");
        let activation = tokio::spawn(async move { orch.activate(slow, 1, &page).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.orch.deactivate(1).await.unwrap();
        assert!(matches!(activation.await.unwrap().unwrap(), ActivationOutcome::Activated(_)));
        assert!(h.orch.session(1).await.unwrap().is_none());
        assert_eq!(h.tab_rules(1).await, 0);
    }

    #[tokio::test]
    async fn test_polling_streams_summaries_until_closed() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        let polled = agent(
            &h.base,
            json!({"id": "poll", "name": "Poll", "pollIntervalSeconds": 1, "onHttpRequest": []}),
        );
        let session = match h.orch.activate(polled, 1, &h.page("/")).await.unwrap() {
            ActivationOutcome::Activated(s) => s,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!(session.polling);
        assert!(h.orch.is_polling(&session.id).await);

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(h.messenger.for_tab(1).contains(&BrowserMessage::InteractionSummary {
            success: true,
            text: Some("periodic".into()),
        }));

        h.orch.close(1).await.unwrap();
        assert!(!h.orch.is_polling(&session.id).await);
    }

    #[tokio::test]
    async fn test_deactivate_keeps_listener_status() {
        let h = Harness::new(|_| vec![]).await;
        h.ready(1).await;
        h.activate(1).await;
        h.orch
            .handle_browser_message(1, json!({"type": "deactivateAgent"}))
            .await
            .unwrap();
        assert!(h.orch.session(1).await.unwrap().is_none());
        assert_eq!(h.tab_rules(1).await, 0);
        // the UI is still there, so the next activation greets immediately
        assert!(matches!(h.activate(1).await, ActivationOutcome::Activated(_)));
        assert!(h.messenger.for_tab(1).len() >= 4);
    }
}
