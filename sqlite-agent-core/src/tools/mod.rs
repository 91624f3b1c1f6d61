pub mod builtin;
pub mod output;
pub mod registry;
pub mod types;

pub use builtin::default_tools;
pub use output::{Table, ToolOutput};
pub use registry::{RegistrySnapshot, ToolRegistry};
pub use types::{FieldKind, InputSchema, SchemaField, ToolHandler, ToolSpec};
