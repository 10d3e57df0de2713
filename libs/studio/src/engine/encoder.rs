//! Output encoding.
//!
//! The sink accumulates rendered samples and hands fixed-length slices to an
//! [`Encoder`]. Chunks leave through a bounded channel that is never awaited
//! from the render path; a full channel drops the chunk.

use chrono::Utc;
use tokio::sync::mpsc;

use super::meter::MixerMetrics;

pub trait Encoder: Send {
    /// MIME-style description of the encoded payload.
    fn content_type(&self) -> &'static str;
    fn encode(&mut self, samples: &[f32]) -> Vec<u8>;
}

/// Interleaved little-endian signed 16-bit PCM.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pcm16Encoder;

impl Encoder for Pcm16Encoder {
    fn content_type(&self) -> &'static str {
        "audio/pcm;bits=16"
    }

    fn encode(&mut self, samples: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples.len() * 2);
        for &s in samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

/// One time slice of encoded output.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub sequence: u64,
    /// Wall-clock capture time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub content_type: &'static str,
    pub data: Vec<u8>,
    pub metrics: MixerMetrics,
}

pub(crate) struct OutputSink {
    encoder: Box<dyn Encoder>,
    pending: Vec<f32>,
    chunk_samples: usize,
    sequence: u64,
    tx: mpsc::Sender<EncodedChunk>,
}

impl OutputSink {
    pub(crate) fn new(
        encoder: Box<dyn Encoder>,
        chunk_samples: usize,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<EncodedChunk>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            encoder,
            pending: Vec::with_capacity(chunk_samples * 2),
            chunk_samples,
            sequence: 0,
            tx,
        };
        (sink, rx)
    }

    /// Append rendered samples, emitting every completed chunk.
    pub(crate) fn push(&mut self, samples: &[f32], metrics: MixerMetrics) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.chunk_samples {
            let data = self.encoder.encode(&self.pending[..self.chunk_samples]);
            self.pending.drain(..self.chunk_samples);
            self.sequence += 1;

            let chunk = EncodedChunk {
                sequence: self.sequence,
                timestamp_ms: Utc::now().timestamp_millis(),
                content_type: self.encoder.content_type(),
                data,
                metrics,
            };
            match self.tx.try_send(chunk) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(chunk)) => {
                    tracing::warn!(sequence = chunk.sequence, "output consumer lagging, chunk dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("output consumer gone");
                }
            }
        }
    }
}
