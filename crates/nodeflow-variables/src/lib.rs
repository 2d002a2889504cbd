pub mod extractor;
pub mod references;
pub mod registry;
pub mod value;

pub use extractor::{Extraction, NestedVariableExtractor, RuntimeVariable, Truncation};
pub use references::{parse_references, validate_references, ReferenceCheck};
pub use registry::{AvailableVariable, VariableOrigin, VariableRegistry};
pub use value::{Inspect, SharedValue, ValueKind};
