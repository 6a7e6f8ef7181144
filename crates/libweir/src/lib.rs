pub mod batch;
pub mod error;
pub mod log;
pub mod presence;
mod records;
pub mod supervisor;

pub use batch::{BatchQueue, EventSink, LogSink, SinkError};
pub use error::WeirError;
pub use log::{EventLog, StreamMeta, Subscription};
pub use presence::PresenceTracker;
pub use supervisor::{Supervisor, SupervisorConfig};
