pub mod catalog;
pub mod flow_state;
pub mod kv;
pub mod listener;
pub mod session;

pub use catalog::{AgentCatalog, MemoryCatalog};
pub use flow_state::FlowStateRepository;
pub use kv::{JsonFileStore, KeyValueStore, MemoryStore};
pub use listener::ListenerRepository;
pub use session::SessionRepository;
