//! Client-side mixing engine.
//!
//! `source -> gain -> bus sum -> limiter -> meter -> output sink`

pub mod dsp;
pub mod encoder;
pub mod gain;
pub mod limiter;
pub mod meter;
pub mod mixer;
pub mod runtime;
pub mod source;

pub use encoder::{EncodedChunk, Encoder, Pcm16Encoder};
pub use meter::MixerMetrics;
pub use mixer::MixingEngine;
pub use runtime::{AudioRuntime, CaptureRequest, CaptureStream, ContextState};
pub use source::{SourceDescriptor, SourceInfo, SourceKind, SourcePatch};
