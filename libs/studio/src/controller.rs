use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::StudioConfig;
use crate::engine::source::unit_gain;
use crate::engine::{
    AudioRuntime, CaptureStream, EncodedChunk, MixerMetrics, MixingEngine, SourceDescriptor,
    SourceInfo, SourceKind, SourcePatch,
};
use crate::error::{LinkError, MixerError, StudioError};
use crate::link::{ClientEvent, GatewayLink, LinkStatus, SessionLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudioState {
    Uninitialized,
    Initialized,
    Live,
    Stopped,
}

/// Where encoded output goes once the broadcast is live.
#[derive(Debug)]
pub enum BroadcastOutput {
    /// Forwarded to the gateway as `broadcast-audio`.
    Linked,
    /// No gateway; the caller consumes the chunks.
    Local(mpsc::Receiver<EncodedChunk>),
}

/// A person joining the mix.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub volume: f32,
    pub muted: bool,
}

impl Participant {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            volume: 1.0,
            muted: false,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    pub fn muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }
}

struct Inner {
    state: StudioState,
    hosts: BTreeSet<String>,
    guests: BTreeSet<String>,
    callers: BTreeSet<String>,
    main_mic_volume: f32,
    guest_mic_volume: f32,
    forwarder: Option<JoinHandle<()>>,
}

impl Inner {
    fn fader(&self, kind: SourceKind) -> f32 {
        match kind {
            SourceKind::Host => self.main_mic_volume,
            SourceKind::Guest | SourceKind::Caller => self.guest_mic_volume,
            SourceKind::Music | SourceKind::Effects => 1.0,
        }
    }

    fn slots(&mut self, kind: SourceKind) -> Option<&mut BTreeSet<String>> {
        match kind {
            SourceKind::Host => Some(&mut self.hosts),
            SourceKind::Guest => Some(&mut self.guests),
            SourceKind::Caller => Some(&mut self.callers),
            SourceKind::Music | SourceKind::Effects => None,
        }
    }
}

/// The operator-facing audio API.
///
/// Maps hosts, guests and callers onto mixer sources (`host_<id>`,
/// `guest_<id>`, `caller_<id>`), enforces per-role limits and owns the
/// main and guest mic faders. When a gateway link is attached, source
/// changes and encoded audio are mirrored to the broadcast session.
pub struct StudioController {
    config: StudioConfig,
    engine: Arc<MixingEngine>,
    link: Mutex<Option<Arc<dyn SessionLink>>>,
    inner: Mutex<Inner>,
}

impl StudioController {
    pub fn new(config: StudioConfig, runtime: Arc<dyn AudioRuntime>) -> Self {
        let engine = Arc::new(MixingEngine::new(config.mixer.clone(), runtime));
        Self {
            config,
            engine,
            link: Mutex::new(None),
            inner: Mutex::new(Inner {
                state: StudioState::Uninitialized,
                hosts: BTreeSet::new(),
                guests: BTreeSet::new(),
                callers: BTreeSet::new(),
                main_mic_volume: 1.0,
                guest_mic_volume: 1.0,
                forwarder: None,
            }),
        }
    }

    /// Connect the gateway link if one is configured. A gateway that cannot
    /// be reached leaves the studio running local-only.
    pub async fn initialize(&self) -> StudioState {
        let current = self.state();
        if current != StudioState::Uninitialized {
            return current;
        }

        match &self.config.gateway_url {
            Some(url) => {
                let info = json!({ "name": "studio" });
                match GatewayLink::connect(
                    url,
                    &self.config.broadcast_id,
                    info,
                    self.config.heartbeat_interval,
                )
                .await
                {
                    Ok(link) => self.attach_link(link),
                    Err(err) => {
                        tracing::warn!(%url, error = %err, "gateway unavailable, studio running local-only");
                    }
                }
            }
            None => tracing::info!("no gateway configured, studio running local-only"),
        }

        self.inner.lock().state = StudioState::Initialized;
        StudioState::Initialized
    }

    pub fn attach_link(&self, link: Arc<dyn SessionLink>) {
        *self.link.lock() = Some(link);
    }

    pub fn link_status(&self) -> Option<LinkStatus> {
        self.link.lock().as_ref().map(|link| link.status())
    }

    pub fn state(&self) -> StudioState {
        self.inner.lock().state
    }

    pub fn engine(&self) -> &Arc<MixingEngine> {
        &self.engine
    }

    pub fn sources(&self) -> Vec<SourceInfo> {
        self.engine.sources()
    }

    pub fn metrics(&self) -> MixerMetrics {
        self.engine.get_metrics()
    }

    pub fn main_mic_volume(&self) -> f32 {
        self.inner.lock().main_mic_volume
    }

    pub fn guest_mic_volume(&self) -> f32 {
        self.inner.lock().guest_mic_volume
    }

    /// Add a host on a live microphone.
    pub async fn add_host(&self, host: Participant) -> Result<SourceInfo, StudioError> {
        self.add(SourceKind::Host, host, None).await
    }

    pub async fn add_guest(&self, guest: Participant) -> Result<SourceInfo, StudioError> {
        self.add(SourceKind::Guest, guest, None).await
    }

    /// Add an accepted caller with its remote stream. Caller sources are
    /// owned by the session registry, so they are not mirrored.
    pub async fn add_caller(
        &self,
        caller: Participant,
        stream: Box<dyn CaptureStream>,
    ) -> Result<SourceInfo, StudioError> {
        self.add(SourceKind::Caller, caller, Some(stream)).await
    }

    /// Add a music or effects bed.
    pub async fn add_bed(
        &self,
        kind: SourceKind,
        bed: Participant,
        stream: Box<dyn CaptureStream>,
    ) -> Result<SourceInfo, StudioError> {
        debug_assert!(matches!(kind, SourceKind::Music | SourceKind::Effects));
        self.add(kind, bed, Some(stream)).await
    }

    async fn add(
        &self,
        kind: SourceKind,
        participant: Participant,
        stream: Option<Box<dyn CaptureStream>>,
    ) -> Result<SourceInfo, StudioError> {
        let source_id = format!("{}_{}", kind.as_str(), participant.id);

        // Slot is held across the capture await and released on failure.
        let role_gain = {
            let mut inner = self.inner.lock();
            if inner.state == StudioState::Uninitialized {
                return Err(StudioError::NotInitialized);
            }
            let limit = self.limit(kind);
            if let Some(slots) = inner.slots(kind) {
                if slots.contains(&source_id) {
                    return Err(MixerError::DuplicateSource(source_id).into());
                }
                if slots.len() >= limit {
                    return Err(StudioError::RoleCapacityExceeded {
                        role: kind.as_str(),
                        limit,
                    });
                }
                slots.insert(source_id.clone());
            }
            inner.fader(kind)
        };

        let mut descriptor = SourceDescriptor::new(source_id.clone(), kind)
            .display_name(participant.display_name)
            .volume(participant.volume)
            .muted(participant.muted)
            .role_gain(role_gain);
        descriptor.capture = stream;

        match self.engine.add_source(descriptor).await {
            Ok(info) => {
                // The fader may have moved while the capture was pending.
                let fader = self.inner.lock().fader(kind);
                let info = if fader != role_gain {
                    self.engine.update_source(
                        &info.id,
                        &SourcePatch {
                            role_gain: Some(fader),
                            ..Default::default()
                        },
                    )?
                } else {
                    info
                };
                if kind != SourceKind::Caller {
                    self.mirror(ClientEvent::ADD_AUDIO_SOURCE, source_payload(&info));
                }
                Ok(info)
            }
            Err(err) => {
                if let Some(slots) = self.inner.lock().slots(kind) {
                    slots.remove(&source_id);
                }
                Err(err.into())
            }
        }
    }

    fn limit(&self, kind: SourceKind) -> usize {
        match kind {
            SourceKind::Host => self.config.max_hosts,
            SourceKind::Guest => self.config.max_guests,
            SourceKind::Caller => self.config.max_callers,
            SourceKind::Music | SourceKind::Effects => usize::MAX,
        }
    }

    pub fn remove_source(&self, source_id: &str) -> Result<SourceInfo, StudioError> {
        let info = self.engine.remove_source(source_id)?;
        if let Some(slots) = self.inner.lock().slots(info.kind) {
            slots.remove(source_id);
        }
        if info.kind != SourceKind::Caller {
            self.mirror(ClientEvent::REMOVE_AUDIO_SOURCE, json!({ "sourceId": source_id }));
        }
        Ok(info)
    }

    pub fn set_source_volume(&self, source_id: &str, volume: f32) -> Result<SourceInfo, StudioError> {
        self.update(
            source_id,
            SourcePatch {
                volume: Some(volume),
                ..Default::default()
            },
        )
    }

    pub fn set_source_muted(&self, source_id: &str, muted: bool) -> Result<SourceInfo, StudioError> {
        self.update(
            source_id,
            SourcePatch {
                muted: Some(muted),
                ..Default::default()
            },
        )
    }

    fn update(&self, source_id: &str, patch: SourcePatch) -> Result<SourceInfo, StudioError> {
        let info = self.engine.update_source(source_id, &patch)?;
        if info.kind != SourceKind::Caller {
            let mut data = serde_json::to_value(&patch).unwrap_or_else(|_| json!({}));
            data["sourceId"] = Value::String(source_id.to_string());
            self.mirror(ClientEvent::UPDATE_AUDIO_SOURCE, data);
        }
        Ok(info)
    }

    /// Rescale every host.
    pub fn set_main_mic_volume(&self, volume: f32) {
        let volume = unit_gain(volume);
        self.inner.lock().main_mic_volume = volume;
        self.apply_fader(&[SourceKind::Host], volume);
    }

    /// Rescale every guest and caller.
    pub fn set_guest_mic_volume(&self, volume: f32) {
        let volume = unit_gain(volume);
        self.inner.lock().guest_mic_volume = volume;
        self.apply_fader(&[SourceKind::Guest, SourceKind::Caller], volume);
    }

    fn apply_fader(&self, kinds: &[SourceKind], volume: f32) {
        let patch = SourcePatch {
            role_gain: Some(volume),
            ..Default::default()
        };
        for source in self.engine.sources() {
            if kinds.contains(&source.kind) {
                // Only fails if the source was removed in between.
                let _ = self.engine.update_source(&source.id, &patch);
            }
        }
    }

    /// Go live. Output waits for the audio context to resume if needed.
    pub async fn start_broadcast(&self) -> Result<BroadcastOutput, StudioError> {
        let previous = {
            let mut inner = self.inner.lock();
            match inner.state {
                StudioState::Uninitialized => return Err(StudioError::NotInitialized),
                StudioState::Live => return Err(StudioError::AlreadyLive),
                StudioState::Initialized | StudioState::Stopped => {}
            }
            if !self.engine.sources().iter().any(|s| s.kind == SourceKind::Host) {
                return Err(StudioError::NoHostPresent);
            }
            std::mem::replace(&mut inner.state, StudioState::Live)
        };

        let chunks = match self.engine.start_output().await {
            Ok(chunks) => chunks,
            Err(err) => {
                self.inner.lock().state = previous;
                return Err(err.into());
            }
        };

        let link = self.link.lock().clone();
        let output = match link {
            Some(link) => {
                let forwarder = tokio::spawn(forward_chunks(chunks, link));
                self.inner.lock().forwarder = Some(forwarder);
                BroadcastOutput::Linked
            }
            None => BroadcastOutput::Local(chunks),
        };

        tracing::info!(broadcast_id = %self.config.broadcast_id, "broadcast live");
        Ok(output)
    }

    /// Stop encoding and release every source. No-op unless live.
    pub fn stop_broadcast(&self) {
        let forwarder = {
            let mut inner = self.inner.lock();
            if inner.state != StudioState::Live {
                return;
            }
            inner.state = StudioState::Stopped;
            inner.hosts.clear();
            inner.guests.clear();
            inner.callers.clear();
            inner.forwarder.take()
        };
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }

        for source in self.engine.sources() {
            if source.kind != SourceKind::Caller {
                self.mirror(ClientEvent::REMOVE_AUDIO_SOURCE, json!({ "sourceId": source.id }));
            }
        }
        self.engine.stop_output();
        tracing::info!(broadcast_id = %self.config.broadcast_id, "broadcast stopped");
    }

    fn mirror(&self, event: &str, data: Value) {
        let link = self.link.lock().clone();
        if let Some(link) = link {
            if let Err(err) = link.send_event(event, data) {
                tracing::warn!(event, error = %err, "could not mirror source change");
            }
        }
    }
}

impl Drop for StudioController {
    fn drop(&mut self) {
        if let Some(forwarder) = self.inner.get_mut().forwarder.take() {
            forwarder.abort();
        }
    }
}

fn source_payload(info: &SourceInfo) -> Value {
    json!({
        "sourceId": info.id,
        "kind": info.kind,
        "displayName": info.display_name,
        "volume": info.volume,
        "muted": info.muted,
        "active": info.active,
        "priority": info.priority,
    })
}

async fn forward_chunks(mut chunks: mpsc::Receiver<EncodedChunk>, link: Arc<dyn SessionLink>) {
    while let Some(chunk) = chunks.recv().await {
        match link.send_audio(&chunk) {
            Ok(()) => {}
            Err(LinkError::Closed) => {
                tracing::warn!("gateway link closed, audio no longer forwarded");
                break;
            }
            Err(err) => tracing::warn!(sequence = chunk.sequence, error = %err, "audio chunk not forwarded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::runtime::fake::FakeRuntime;
    use crate::engine::ContextState;
    use crate::error::CaptureError;

    #[derive(Default)]
    struct RecordingLink {
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingLink {
        fn events(&self) -> Vec<String> {
            self.sent.lock().iter().map(|(e, _)| e.clone()).collect()
        }
    }

    impl SessionLink for RecordingLink {
        fn status(&self) -> LinkStatus {
            LinkStatus::Connected
        }

        fn send_event(&self, event: &str, data: Value) -> Result<(), LinkError> {
            self.sent.lock().push((event.to_string(), data));
            Ok(())
        }

        fn close(&self) {}
    }

    async fn studio(runtime: &Arc<FakeRuntime>) -> StudioController {
        let config = StudioConfig {
            broadcast_id: "bid-1".into(),
            ..Default::default()
        };
        let studio = StudioController::new(config, runtime.clone());
        assert_eq!(studio.initialize().await, StudioState::Initialized);
        studio
    }

    fn render(studio: &StudioController, frames: usize) {
        let engine = studio.engine();
        let mut out = vec![0.0; frames * engine.config().channels()];
        engine.render(&mut out);
    }

    #[tokio::test]
    async fn main_fader_rescales_existing_and_new_hosts() {
        let runtime = FakeRuntime::new();
        let studio = studio(&runtime).await;
        studio.engine().resume().await;

        studio.add_host(Participant::new("a").volume(1.0)).await.unwrap();
        studio.set_main_mic_volume(0.5);
        render(&studio, studio.engine().config().smoothing_frames());
        assert_eq!(studio.engine().current_gain("host_a"), Some(0.5));

        studio.add_host(Participant::new("b").volume(0.8)).await.unwrap();
        assert_eq!(studio.engine().current_gain("host_b"), Some(0.4));
    }

    #[tokio::test]
    async fn guest_fader_covers_guests_and_callers_only() {
        let runtime = FakeRuntime::new();
        let studio = studio(&runtime).await;
        studio.add_host(Participant::new("a")).await.unwrap();
        studio.add_guest(Participant::new("g")).await.unwrap();
        studio
            .add_caller(Participant::new("conn_1"), runtime.capture(0.3))
            .await
            .unwrap();
        studio.engine().resume().await;

        studio.set_guest_mic_volume(0.25);
        render(&studio, 480);

        assert_eq!(studio.engine().current_gain("host_a"), Some(1.0));
        assert_eq!(studio.engine().current_gain("guest_g"), Some(0.25));
        assert_eq!(studio.engine().current_gain("caller_conn_1"), Some(0.25));
    }

    #[tokio::test]
    async fn non_finite_fader_mutes_its_role_and_spares_the_rest() {
        let runtime = FakeRuntime::new();
        let studio = studio(&runtime).await;
        studio.add_host(Participant::new("a")).await.unwrap();
        studio.add_guest(Participant::new("g")).await.unwrap();
        studio.engine().resume().await;

        studio.set_guest_mic_volume(f32::NAN);
        render(&studio, studio.engine().config().smoothing_frames());

        assert_eq!(studio.guest_mic_volume(), 0.0);
        assert_eq!(studio.engine().current_gain("guest_g"), Some(0.0));
        assert_eq!(studio.engine().current_gain("host_a"), Some(1.0));
    }

    #[tokio::test]
    async fn role_limits_are_enforced_and_failed_adds_free_their_slot() {
        let runtime = FakeRuntime::new();
        let studio = studio(&runtime).await;

        runtime.script_capture(Err(CaptureError::PermissionDenied));
        let denied = studio.add_host(Participant::new("a")).await.unwrap_err();
        assert_eq!(denied, StudioError::Mixer(MixerError::Capture(CaptureError::PermissionDenied)));

        studio.add_host(Participant::new("a")).await.unwrap();
        studio.add_host(Participant::new("b")).await.unwrap();
        let full = studio.add_host(Participant::new("c")).await.unwrap_err();
        assert_eq!(
            full,
            StudioError::RoleCapacityExceeded {
                role: "host",
                limit: 2
            }
        );

        studio.remove_source("host_a").unwrap();
        studio.add_host(Participant::new("c")).await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_state_machine() {
        let runtime = FakeRuntime::new();
        let studio = StudioController::new(StudioConfig::default(), runtime.clone());
        assert_eq!(studio.start_broadcast().await.unwrap_err(), StudioError::NotInitialized);
        assert_eq!(
            studio.add_host(Participant::new("a")).await.unwrap_err(),
            StudioError::NotInitialized
        );

        studio.initialize().await;
        assert_eq!(studio.start_broadcast().await.unwrap_err(), StudioError::NoHostPresent);

        studio.add_host(Participant::new("a")).await.unwrap();
        let output = studio.start_broadcast().await.unwrap();
        assert!(matches!(output, BroadcastOutput::Local(_)));
        assert_eq!(studio.state(), StudioState::Live);
        assert_eq!(studio.start_broadcast().await.unwrap_err(), StudioError::AlreadyLive);

        studio.stop_broadcast();
        assert_eq!(studio.state(), StudioState::Stopped);
        assert!(studio.sources().is_empty());
        assert_eq!(runtime.stops.load(std::sync::atomic::Ordering::SeqCst), 1);
        studio.stop_broadcast();
        assert_eq!(studio.state(), StudioState::Stopped);

        // A stopped studio can go live again with a fresh host.
        studio.add_host(Participant::new("a")).await.unwrap();
        assert!(studio.start_broadcast().await.is_ok());
    }

    #[tokio::test]
    async fn going_live_before_the_context_resumes_is_tolerated() {
        let runtime = FakeRuntime::new();
        runtime.withhold_resume();
        let studio = studio(&runtime).await;
        studio.add_host(Participant::new("a")).await.unwrap();

        let BroadcastOutput::Local(mut chunks) = studio.start_broadcast().await.unwrap() else {
            panic!("expected local output");
        };
        assert_eq!(studio.state(), StudioState::Live);
        assert_eq!(studio.engine().context_state(), ContextState::Suspended);

        render(&studio, 4_800);
        assert!(chunks.try_recv().is_err());

        runtime.allow_resume();
        studio.engine().resume().await;
        render(&studio, 4_800);
        assert_eq!(chunks.try_recv().unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn source_changes_and_audio_are_mirrored_to_the_link() {
        let runtime = FakeRuntime::new();
        let studio = studio(&runtime).await;
        let link = Arc::new(RecordingLink::default());
        studio.attach_link(link.clone());

        studio.add_host(Participant::new("a").name("Alex")).await.unwrap();
        studio
            .add_caller(Participant::new("conn_1"), runtime.capture(0.3))
            .await
            .unwrap();
        studio.set_source_muted("host_a", true).unwrap();

        {
            let sent = link.sent.lock();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[0].0, ClientEvent::ADD_AUDIO_SOURCE);
            assert_eq!(sent[0].1["sourceId"], "host_a");
            assert_eq!(sent[0].1["kind"], "host");
            assert_eq!(sent[0].1["displayName"], "Alex");
            assert_eq!(sent[1].0, ClientEvent::UPDATE_AUDIO_SOURCE);
            assert_eq!(sent[1].1, json!({ "sourceId": "host_a", "muted": true }));
        }

        let output = studio.start_broadcast().await.unwrap();
        assert!(matches!(output, BroadcastOutput::Linked));
        render(&studio, 4_800);

        let mut forwarded = false;
        for _ in 0..100 {
            if link.events().iter().any(|e| e == ClientEvent::BROADCAST_AUDIO) {
                forwarded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(forwarded, "no broadcast-audio forwarded");

        studio.stop_broadcast();
        assert_eq!(link.events().last().unwrap(), ClientEvent::REMOVE_AUDIO_SOURCE);
    }

    #[tokio::test]
    async fn unreachable_gateway_degrades_to_local_only() {
        let runtime = FakeRuntime::new();
        let config = StudioConfig {
            gateway_url: Some("ws://127.0.0.1:1/gateway".into()),
            ..Default::default()
        };
        let studio = StudioController::new(config, runtime.clone());

        assert_eq!(studio.initialize().await, StudioState::Initialized);
        assert_eq!(studio.link_status(), None);

        studio.add_host(Participant::new("a")).await.unwrap();
        assert!(matches!(
            studio.start_broadcast().await.unwrap(),
            BroadcastOutput::Local(_)
        ));
    }
}
