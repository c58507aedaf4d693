//! LLM integration module.
//!
//! Provides an OpenAI-compatible client for LLM API calls and
//! the prompts used for answer generation and judging.

mod client;
mod prompts;

pub use client::{LlmClient, Message, Role, extract_json};
pub use prompts::Prompts;
