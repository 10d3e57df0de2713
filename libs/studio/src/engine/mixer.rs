use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::encoder::{EncodedChunk, Encoder, OutputSink, Pcm16Encoder};
use super::gain::GainControl;
use super::limiter::Limiter;
use super::meter::{LevelMeter, MixerMetrics};
use super::runtime::{AudioRuntime, CaptureRequest, CaptureStream, ContextState};
use super::source::{unit_gain, SourceDescriptor, SourceInfo, SourcePatch};
use crate::config::MixerConfig;
use crate::error::MixerError;

struct SourceNode {
    info: SourceInfo,
    gain: GainControl,
    capture: Option<Box<dyn CaptureStream>>,
}

impl SourceNode {
    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.info.active = false;
    }
}

struct Graph {
    sources: BTreeMap<String, SourceNode>,
    limiter: Limiter,
    meter: LevelMeter,
    scratch: Vec<f32>,
    sink: Option<OutputSink>,
    metrics: MixerMetrics,
}

/// Sums every source through its own gain stage, then runs the bus through
/// the limiter and the meter before handing it to the output sink.
///
/// Control calls only edit the graph; the audible effect lands on the next
/// [`render`](Self::render) call, which the platform drives from its
/// processing callback.
pub struct MixingEngine {
    config: MixerConfig,
    runtime: Arc<dyn AudioRuntime>,
    graph: Mutex<Graph>,
}

impl MixingEngine {
    pub fn new(config: MixerConfig, runtime: Arc<dyn AudioRuntime>) -> Self {
        let channels = config.channels();
        let graph = Graph {
            sources: BTreeMap::new(),
            limiter: Limiter::new(config.sample_rate, channels),
            meter: LevelMeter::new(config.sample_rate, channels),
            scratch: Vec::new(),
            sink: None,
            metrics: MixerMetrics::default(),
        };
        Self {
            config,
            runtime,
            graph: Mutex::new(graph),
        }
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    pub fn context_state(&self) -> ContextState {
        self.runtime.state()
    }

    pub async fn add_source(&self, mut descriptor: SourceDescriptor) -> Result<SourceInfo, MixerError> {
        let admitted = self.admit(&self.graph.lock(), &descriptor.id);
        if let Err(err) = admitted {
            release_capture(&mut descriptor.capture);
            return Err(err);
        }

        // The graph stays unlocked while the platform decides on the capture.
        if descriptor.capture.is_none() && descriptor.kind.needs_capture() {
            let request = CaptureRequest {
                kind: descriptor.kind,
                sample_rate: self.config.sample_rate,
                channels: self.config.channels(),
            };
            match self.runtime.request_capture(request).await {
                Ok(capture) => descriptor.capture = Some(capture),
                Err(err) => {
                    tracing::warn!(source_id = %descriptor.id, error = %err, "capture request failed");
                    return Err(err.into());
                }
            }
        }

        let mut graph = self.graph.lock();
        if let Err(err) = self.admit(&graph, &descriptor.id) {
            release_capture(&mut descriptor.capture);
            return Err(err);
        }

        let info = SourceInfo {
            id: descriptor.id.clone(),
            kind: descriptor.kind,
            display_name: descriptor.display_name,
            volume: unit_gain(descriptor.volume),
            muted: descriptor.muted,
            active: descriptor.capture.is_some(),
            priority: descriptor.priority,
            role_gain: unit_gain(descriptor.role_gain),
        };
        let node = SourceNode {
            gain: GainControl::new(info.effective_gain()),
            info: info.clone(),
            capture: descriptor.capture,
        };
        graph.sources.insert(info.id.clone(), node);

        tracing::info!(source_id = %info.id, kind = info.kind.as_str(), "source added to mix");
        Ok(info)
    }

    fn admit(&self, graph: &Graph, id: &str) -> Result<(), MixerError> {
        if self.runtime.state() == ContextState::Closed {
            return Err(MixerError::ContextClosed);
        }
        if graph.sources.contains_key(id) {
            return Err(MixerError::DuplicateSource(id.to_string()));
        }
        if graph.sources.len() >= self.config.max_sources {
            return Err(MixerError::CapacityExceeded(self.config.max_sources));
        }
        Ok(())
    }

    /// Merge `patch` into a source. Gain changes ramp over the smoothing window.
    pub fn update_source(&self, id: &str, patch: &SourcePatch) -> Result<SourceInfo, MixerError> {
        let mut graph = self.graph.lock();
        let Some(node) = graph.sources.get_mut(id) else {
            tracing::warn!(source_id = %id, "update for unknown source ignored");
            return Err(MixerError::SourceNotFound(id.to_string()));
        };
        if node.info.apply(patch) {
            node.gain
                .ramp_to(node.info.effective_gain(), self.config.smoothing_frames());
        }
        Ok(node.info.clone())
    }

    pub fn remove_source(&self, id: &str) -> Result<SourceInfo, MixerError> {
        let removed = self.graph.lock().sources.remove(id);
        let Some(mut node) = removed else {
            tracing::warn!(source_id = %id, "remove for unknown source ignored");
            return Err(MixerError::SourceNotFound(id.to_string()));
        };
        node.release();
        tracing::info!(source_id = %id, "source removed from mix");
        Ok(node.info)
    }

    pub fn source(&self, id: &str) -> Option<SourceInfo> {
        self.graph.lock().sources.get(id).map(|n| n.info.clone())
    }

    pub fn sources(&self) -> Vec<SourceInfo> {
        self.graph
            .lock()
            .sources
            .values()
            .map(|n| n.info.clone())
            .collect()
    }

    /// Gain the source's stage will apply to its next frame.
    pub fn current_gain(&self, id: &str) -> Option<f32> {
        self.graph.lock().sources.get(id).map(|n| n.gain.current())
    }

    /// Begin encoding with the default PCM16 encoder.
    pub async fn start_output(&self) -> Result<mpsc::Receiver<EncodedChunk>, MixerError> {
        self.start_output_with(Box::new(Pcm16Encoder)).await
    }

    /// Attach an output sink and ask the runtime to resume. If the context
    /// stays suspended the sink waits; chunks flow once [`resume`](Self::resume)
    /// succeeds.
    pub async fn start_output_with(
        &self,
        encoder: Box<dyn Encoder>,
    ) -> Result<mpsc::Receiver<EncodedChunk>, MixerError> {
        if self.runtime.state() == ContextState::Closed {
            return Err(MixerError::ContextClosed);
        }

        let (sink, rx) = OutputSink::new(
            encoder,
            self.config.chunk_samples(),
            self.config.output_buffer_chunks,
        );
        if self.graph.lock().sink.replace(sink).is_some() {
            tracing::warn!("output restarted, previous consumer detached");
        }

        match self.resume().await {
            ContextState::Running => tracing::info!("output started"),
            ContextState::Suspended => tracing::info!("output queued until the audio context resumes"),
            ContextState::Closed => return Err(MixerError::ContextClosed),
        }
        Ok(rx)
    }

    pub async fn resume(&self) -> ContextState {
        let state = self.runtime.resume().await;
        tracing::debug!(?state, "audio context resume requested");
        state
    }

    /// Stop encoding and release every source.
    pub fn stop_output(&self) {
        let mut graph = self.graph.lock();
        graph.sink = None;
        for (_, mut node) in std::mem::take(&mut graph.sources) {
            node.release();
        }
        graph.limiter.reset();
        graph.metrics = MixerMetrics::default();
        tracing::info!("output stopped");
    }

    pub fn is_outputting(&self) -> bool {
        self.graph.lock().sink.is_some()
    }

    pub fn get_metrics(&self) -> MixerMetrics {
        self.graph.lock().metrics
    }

    /// Render one quantum of interleaved output into `out`.
    ///
    /// Writes silence while the context is not running.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        if self.runtime.state() != ContextState::Running {
            return;
        }

        let channels = self.config.channels();
        let mut graph = self.graph.lock();
        let Graph {
            sources,
            limiter,
            meter,
            scratch,
            sink,
            metrics,
        } = &mut *graph;

        scratch.resize(out.len(), 0.0);
        for node in sources.values_mut() {
            scratch.fill(0.0);
            if let Some(capture) = node.capture.as_mut() {
                let written = capture.read(scratch).min(scratch.len());
                scratch[written..].fill(0.0);
            }
            for (frame, input) in out.chunks_mut(channels).zip(scratch.chunks(channels)) {
                let gain = node.gain.next_frame();
                for (o, i) in frame.iter_mut().zip(input) {
                    *o += i * gain;
                }
            }
        }

        let input_level = meter.measure_input(out);
        limiter.process(out);
        let (output_level, peak_level) = meter.measure_output(out);

        *metrics = MixerMetrics {
            input_level,
            output_level,
            peak_level,
            active_source_count: sources.values().filter(|n| n.info.active).count(),
        };

        if let Some(sink) = sink.as_mut() {
            sink.push(out, *metrics);
        }
    }
}

impl Drop for MixingEngine {
    fn drop(&mut self) {
        for node in self.graph.get_mut().sources.values_mut() {
            node.release();
        }
    }
}

fn release_capture(capture: &mut Option<Box<dyn CaptureStream>>) {
    if let Some(mut capture) = capture.take() {
        capture.stop();
    }
}
