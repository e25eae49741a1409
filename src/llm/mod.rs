pub mod openai;
pub mod provider;
pub mod types;

pub use openai::OpenAiClient;
pub use provider::LlmProvider;
pub use types::{ChatMessage, ChatRequest, ProviderModel};
