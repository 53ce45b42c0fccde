use futures::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use tabpilot_core::{Agent, AgentManifest, Flow, ServiceError, ServiceResult};
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::sse::{SseDecoder, SseEvent};

/// One piece of an answer: streamed text, or an automation flow.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerFragment {
    Text(String),
    Flow(Flow),
}

/// Finite, single-consumer sequence of answer fragments. The next network read
/// only happens once the previous fragment has been taken.
pub type AnswerStream = Pin<Box<dyn Stream<Item = ServiceResult<AnswerFragment>> + Send>>;

#[derive(Deserialize)]
struct SessionCreated {
    id: Value,
}

#[derive(Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct InteractionSummary {
    #[serde(default)]
    summary: Option<String>,
}

fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> &str {
    if max_bytes >= s.len() {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn content_type(response: &Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn detail_text(value: &Value) -> Option<String> {
    match value.get("detail")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Turn a non-2xx response into a `ServiceError`, keeping the JSON `detail`.
async fn check_status(response: Response) -> ServiceResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let is_json = content_type(&response).contains("json");
    let body = response.text().await.unwrap_or_default();
    error!(status = %status, body = %truncate_at_char_boundary(&body, 500), "Agent API error");
    let detail = if is_json {
        serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| detail_text(&v))
    } else {
        None
    };
    Err(ServiceError::new(Some(status.as_u16()), detail))
}

async fn read_json<T: DeserializeOwned>(response: Response) -> ServiceResult<T> {
    response.json::<T>().await.map_err(|e| {
        warn!(error = %e, "Malformed agent response body");
        ServiceError::without_detail()
    })
}

fn transport_failure(url: &str, e: reqwest::Error) -> ServiceError {
    warn!(url = %url, error = %e, "Agent request failed");
    ServiceError::without_detail()
}

/// Run a manifest-declared HTTP action (activation, session close, interaction lookup).
///
/// These calls are not authenticated. An empty body yields `Value::Null` and a
/// non-JSON body is returned as a string.
pub async fn call_http_action(http: &Client, url: &str, method: Option<&str>) -> ServiceResult<Value> {
    let method = method
        .and_then(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok())
        .unwrap_or(Method::GET);
    debug!(url = %url, method = %method, "Running agent http action");
    let response = http
        .request(method, url)
        .send()
        .await
        .map_err(|e| transport_failure(url, e))?;
    let response = check_status(response).await?;
    let body = response.text().await.map_err(|e| transport_failure(url, e))?;
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
}

/// Client for one agent's question/answer endpoints.
#[derive(Clone)]
pub struct AgentClient {
    http: Client,
    base_url: String,
}

impl AgentClient {
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn for_agent(http: &Client, agent: &Agent) -> Self {
        Self::new(http.clone(), &agent.url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Load an agent from `{url}/manifest.json`.
    pub async fn fetch_manifest(http: &Client, url: &str) -> ServiceResult<Agent> {
        let base = url.trim_end_matches('/');
        let manifest_url = format!("{}/manifest.json", base);
        let response = http
            .get(&manifest_url)
            .send()
            .await
            .map_err(|e| transport_failure(&manifest_url, e))?;
        let manifest: AgentManifest = read_json(check_status(response).await?).await?;
        info!(agent_id = %manifest.id, url = %base, "Loaded agent manifest");
        Ok(Agent::new(base, manifest))
    }

    async fn post(&self, path: &str, body: &Value, auth: Option<&Authenticator>) -> ServiceResult<Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.post(&url).json(body);
        if let Some(auth) = auth {
            request = request.bearer_auth(auth.bearer().await?);
        }
        let response = request.send().await.map_err(|e| transport_failure(&url, e))?;
        check_status(response).await
    }

    pub async fn create_session(&self, locales: &[String], auth: Option<&Authenticator>) -> ServiceResult<String> {
        if let Some(auth) = auth {
            auth.login().await?;
        }
        let response = self.post("/sessions", &json!({ "locales": locales }), auth).await?;
        let created: SessionCreated = read_json(response).await?;
        let id = match created.id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        info!(session_id = %id, agent = %self.base_url, "Agent session created");
        Ok(id)
    }

    /// Ask a question. A `text/event-stream` reply is streamed fragment by
    /// fragment; a JSON reply yields its `answer` (or `steps` flow) once.
    pub async fn ask(&self, question: &str, session_id: &str, auth: Option<&Authenticator>) -> ServiceResult<AnswerStream> {
        let path = format!("/sessions/{}/questions", session_id);
        let response = self.post(&path, &json!({ "question": question }), auth).await?;
        if content_type(&response).starts_with("text/event-stream") {
            debug!(session_id = %session_id, "Streaming answer");
            return Ok(sse_stream(Box::pin(response.bytes_stream())));
        }
        let body: Value = read_json(response).await?;
        let fragment = json_answer(body)?;
        Ok(Box::pin(futures::stream::once(async move { Ok(fragment) })))
    }

    pub async fn transcribe(&self, audio_base64: &str, session_id: &str, auth: Option<&Authenticator>) -> ServiceResult<String> {
        let path = format!("/sessions/{}/transcriptions", session_id);
        let response = self.post(&path, &json!({ "file": audio_base64 }), auth).await?;
        let transcription: Transcription = read_json(response).await?;
        Ok(transcription.text)
    }

    pub async fn summarize_interaction(&self, detail: &Value, session_id: &str, auth: Option<&Authenticator>) -> ServiceResult<String> {
        let path = format!("/sessions/{}/interactions", session_id);
        let response = self.post(&path, detail, auth).await?;
        let interaction: InteractionSummary = read_json(response).await?;
        Ok(interaction.summary.unwrap_or_default())
    }
}

fn json_answer(body: Value) -> ServiceResult<AnswerFragment> {
    if let Some(answer) = body.get("answer") {
        return Ok(AnswerFragment::Text(answer.as_str().map(str::to_string).unwrap_or_else(|| answer.to_string())));
    }
    if body.get("steps").is_some() {
        return serde_json::from_value::<Flow>(body)
            .map(AnswerFragment::Flow)
            .map_err(|e| {
                warn!(error = %e, "Malformed flow in answer");
                ServiceError::without_detail()
            });
    }
    warn!("Answer carries neither 'answer' nor 'steps'");
    Err(ServiceError::without_detail())
}

impl SseEvent {
    /// `error` events fail the answer; named events carry a flow; unnamed ones are text.
    pub fn into_fragment(self) -> ServiceResult<AnswerFragment> {
        match self.event.as_deref() {
            Some("error") => {
                let detail = serde_json::from_str::<Value>(&self.data)
                    .ok()
                    .and_then(|v| detail_text(&v))
                    .or_else(|| Some(self.data.clone()).filter(|d| !d.is_empty()));
                Err(ServiceError::new(None, detail))
            }
            Some(name) => serde_json::from_str::<Flow>(&self.data)
                .map(AnswerFragment::Flow)
                .map_err(|e| {
                    warn!(event = %name, error = %e, "Malformed event payload");
                    ServiceError::without_detail()
                }),
            None => Ok(AnswerFragment::Text(self.data)),
        }
    }
}

struct SseState<S> {
    body: S,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    eof: bool,
    failed: bool,
}

/// Lazily decode an SSE byte stream into answer fragments. The sequence ends
/// after the first error.
pub(crate) fn sse_stream<S, B, E>(body: S) -> AnswerStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        eof: false,
        failed: false,
    };
    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if st.failed {
                return None;
            }
            if let Some(event) = st.pending.pop_front() {
                let fragment = event.into_fragment();
                if fragment.is_err() {
                    st.failed = true;
                }
                return Some((fragment, st));
            }
            if st.eof {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    let events = st.decoder.push(chunk.as_ref());
                    st.pending.extend(events);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Answer stream interrupted");
                    st.failed = true;
                    return Some((Err(ServiceError::without_detail()), st));
                }
                None => {
                    st.eof = true;
                    st.pending.extend(st.decoder.finish());
                }
            }
        }
    }))
}
