pub mod flow;
pub mod header_rules;
pub mod matcher;
pub mod orchestrator;
pub mod outbox;
pub mod queue;
pub mod template;

pub use flow::{FlowExecutor, FlowReporter, PageDriver, Selector};
pub use header_rules::{HeaderRule, HeaderRuleHost, HeaderRuleManager, MemoryRuleHost};
pub use matcher::{activates_on, find_activation_rule, find_matching_actions, matches};
pub use orchestrator::{ActivationOutcome, Orchestrator};
pub use outbox::{Outbox, TabMessenger};
pub use queue::{QueuedJob, TabQueues};
pub use template::{solve_url_template, TemplateContext};
