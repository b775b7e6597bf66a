pub mod client;
pub mod error;
pub mod types;

pub use client::{AnthropicClient, CompletionClient};
pub use error::ProviderError;
pub use types::{Completion, Usage};
