//! Studio side of a live broadcast: the mixing engine, the operator-facing
//! controller, and the link to the broadcast gateway.

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod link;

pub use config::{MixerConfig, StudioConfig};
pub use controller::{BroadcastOutput, Participant, StudioController, StudioState};
pub use engine::{
    AudioRuntime, CaptureRequest, CaptureStream, ContextState, EncodedChunk, Encoder,
    MixerMetrics, MixingEngine, Pcm16Encoder, SourceDescriptor, SourceInfo, SourceKind,
    SourcePatch,
};
pub use error::{CaptureError, LinkError, MixerError, StudioError};
pub use link::{GatewayLink, LinkStatus, ServerEvent, SessionLink};
