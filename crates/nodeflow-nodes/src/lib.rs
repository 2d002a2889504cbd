pub mod builtin;
pub mod expression;
pub mod registry;

pub use expression::{check_expression, RhaiEvaluator};
pub use registry::{NodeRegistry, PluginInfo};
