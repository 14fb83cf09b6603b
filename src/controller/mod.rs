//! Controller subsystem for the publishing lifecycle
//!
//! [`publisher`] exposes the only two legal states to the UI layer:
//!
//! ```text
//! Idle ──start()──► Publishing ──stop() / fatal failure──► Idle
//! ```
//!
//! Each `start()` builds a fresh session (identity, queue, sample source, drain loop),
//! so nothing from a previous session is published after a restart.

pub mod publisher;

pub use publisher::PublisherController;
