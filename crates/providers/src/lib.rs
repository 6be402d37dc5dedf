//! Language-model back-ends for meshtalk.
//!
//! All providers implement the `meshtalk_core::Provider` trait and stream
//! decoded chunks over a channel. `build_provider` picks one from config.

pub mod anthropic;
pub mod framing;
pub mod ollama;
pub mod openai_compat;
pub mod router;
pub mod transport;
pub mod wire;

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use router::build_provider;
pub use transport::Transport;
