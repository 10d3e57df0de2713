//! Boundary between the mixing engine and the host audio platform.
//!
//! The processing context starts suspended and only runs after an explicit
//! resume, which a platform may gate on user interaction. Capture acquisition
//! is asynchronous and may be refused.

use async_trait::async_trait;

use super::source::SourceKind;
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub kind: SourceKind,
    pub sample_rate: u32,
    pub channels: usize,
}

/// A live input owned by exactly one source.
pub trait CaptureStream: Send {
    /// Fill `out` with interleaved samples. Returns how many were written;
    /// the engine treats the remainder as silence.
    fn read(&mut self, out: &mut [f32]) -> usize;

    /// Release the underlying device. Called once, on source removal.
    fn stop(&mut self);
}

#[async_trait]
pub trait AudioRuntime: Send + Sync {
    fn state(&self) -> ContextState;

    /// Ask the platform to start processing. May leave the context suspended.
    async fn resume(&self) -> ContextState;

    async fn request_capture(
        &self,
        request: CaptureRequest,
    ) -> Result<Box<dyn CaptureStream>, CaptureError>;
}
