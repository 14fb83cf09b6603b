//! # Location Module
//!
//! Origin of the position samples that get published. The platform positioning and
//! permission services are external collaborators, reached only through the
//! [`LocationProvider`] and [`PermissionGate`] traits.
//!
//! ```text
//! location/
//! ├── sample.rs     - Immutable LocationSample value
//! ├── source.rs     - SampleSource state machine and collaborator traits
//! └── simulated.rs  - Synthetic provider and fixed permission gate for desktop runs
//! ```

pub mod sample;
pub mod simulated;
pub mod source;

pub use sample::LocationSample;
pub use simulated::{SimulatedProvider, SimulatedTrack, StaticPermission};
pub use source::{
    Active, Idle, LocationProvider, PermissionGate, SampleSink, SampleSource, SourceError,
    UpdateRequest,
};
