pub mod agent_client;
pub mod auth;
pub mod client;
pub mod sse;

pub use agent_client::{call_http_action, AgentClient, AnswerFragment, AnswerStream};
pub use auth::{AccessToken, Authenticator, StaticTokenProvider, TokenProvider};
pub use client::build_http_client;
pub use sse::{SseDecoder, SseEvent};
