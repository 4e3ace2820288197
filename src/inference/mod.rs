//! Inference Client: OpenAI-compatible API client for the reasoning engine.
//!
//! This module handles all communication with the model endpoint:
//! - Non-streaming chat completions with native tool calling
//! - Response parsing, including reasoning-block removal
//! - Fallback chain management
//! - The `model:` configuration section
//!
//! The client speaks the OpenAI Chat Completions API, so Ollama, llama.cpp,
//! vLLM or a hosted endpoint are interchangeable via config.

pub mod client;
pub mod config;
pub mod errors;
pub mod response;
pub mod types;

// Re-exports for convenience
pub use client::{InferenceClient, DEFAULT_SYSTEM_PROMPT};
pub use config::ModelConfig;
pub use errors::InferenceError;
pub use types::{ChatMessage, ModelReply, Role};
