pub mod poller;

pub use poller::{PollJob, PollService};
