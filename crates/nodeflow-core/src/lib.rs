pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod path;
pub mod template;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use context::{ExecutionContext, OutputMap, RunInfo};
pub use error::{ErrorKind, FlowError, Result};
pub use event::{BusEvent, EventBus, Subscription};
pub use traits::{EvalScope, ExpressionEvaluator, LlmClient, NodePlugin};
pub use types::*;
