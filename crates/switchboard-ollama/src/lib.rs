//! Ollama-protocol backend client for Switchboard.
//!
//! Speaks the local inference daemon's JSON-over-HTTP protocol: `generate`
//! for buffered and NDJSON-streamed completions, `tags` for the model
//! listing the pool uses as its health probe, and `pull` for warm-up
//! loads. One [`OllamaBackend`] wraps one endpoint; the pool holds one per
//! configured URL.

mod client;

pub use client::OllamaBackend;
