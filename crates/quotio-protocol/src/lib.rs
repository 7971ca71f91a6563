//! Wire-level helpers shared by the dispatch engine and the HTTP surface.
//!
//! This crate stays free of any HTTP client or server dependency: it only
//! knows how to split server-sent-event streams and how to read the handful
//! of OpenAI-compatible envelope fields the dispatcher inspects.

pub mod openai;
pub mod sse;

pub use openai::{ChatEnvelope, ErrorBody, ModelEntry, ModelList};
pub use sse::{SseEvent, SseStreamParser};
