//! API translation between the OpenAI chat-completions and Gemini formats.
//!
//! The core of the gateway: converts requests, responses, and streaming
//! events between the two wire formats. Everything here is pure apart from
//! remote image fetches in [`media`].

pub mod embeddings;
pub mod framer;
pub mod gemini_types;
pub mod media;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod schema;
pub mod streaming;
pub mod tool_calls;
