pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{Result, StepflowError};
pub use event::{EventBus, EventSink, EventType, RunEvent};
pub use traits::{handler_fn, HandlerOutcome, HandlerRequest, NodeHandler};
pub use types::*;
