pub mod factory;
pub mod http;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod types;

pub use factory::create_provider;
pub use types::{
    ChatMessage, GenerateOptions, ModelProvider, ModelResponse, StructuredSchema, ToolCall,
    ToolDeclaration,
};
