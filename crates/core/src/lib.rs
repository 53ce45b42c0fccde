pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod types;

pub use config::Config;
pub use error::{Error, FlowStepError, FlowStepErrorKind, Result, ServiceError, ServiceResult};
pub use message::{Attachment, BrowserMessage};
pub use paths::Paths;
pub use types::{
    Action, ActivateAction, AddHeaderAction, Agent, AgentManifest, AuthConfig, Condition,
    EndAction, Flow, FlowAction, FlowState, FlowStep, HttpRequestAction, Prompt,
    RecordInteractionAction, RequestEvent, RequestEventType, Rule, Session, TabId,
};
