//! bedtime-pipeline - unattended daily production of narrated bedtime content.
//!
//! Generates stories, poems and lullabies, narrates them in several voices,
//! checks each narration against its text, and publishes what passes.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod args;
pub mod assembler;
pub mod audio;
pub mod checkpoint;
pub mod chunker;
pub mod config;
pub mod directive;
pub mod error;
pub mod fidelity;
pub mod hooks;
pub mod http;
pub mod llm;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod pool;
pub mod qa;
pub mod retry;
pub mod stages;
pub mod state;
pub mod stt;
pub mod testing;
pub mod tts;

pub use error::{PipelineError, Result};
pub use orchestrator::{Orchestrator, RunResult};
