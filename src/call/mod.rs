//! # Call Module
//!
//! Everything that exists per live call: the registry of sessions, the
//! inbound event contract, the dialogue loop and the pipeline that wires
//! them together.

pub mod dialogue;
pub mod directory;
pub mod events;
pub mod outbound;
pub mod pipeline;
pub mod registry;

pub use directory::CallDirectory;
pub use events::CallEvent;
pub use outbound::{OutboundAudio, OutboundRouter};
pub use pipeline::{CallPipeline, PipelineServices, PipelineSettings};
pub use registry::SessionRegistry;
