//! Protocol engine for the Nikobus PC-Link / Feedback-Module bus: a
//! serial or TCP link carrying CR-delimited ASCII frames, and the
//! stateful components (scheduler, cache, button and cover state
//! machines) that turn that link into a small set of async verbs.

pub mod button;
pub mod codec;
pub mod config;
pub mod cover;
pub mod engine;
pub mod error;
pub mod events;
pub mod listener;
pub mod scheduler;
pub mod state_cache;
pub mod transport;
pub mod types;

pub use config::ConfigSink;
pub use engine::NikobusEngine;
pub use error::{NikobusError, Result};
pub use events::EngineEvent;
