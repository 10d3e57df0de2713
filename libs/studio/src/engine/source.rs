use serde::{Deserialize, Serialize};

use super::dsp::validate_float;
use super::runtime::CaptureStream;

/// Clamp a fader value to the unit range. Non-finite input is silence.
pub(crate) fn unit_gain(value: f32) -> f32 {
    validate_float(value).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Host,
    Guest,
    Caller,
    Music,
    Effects,
}

impl SourceKind {
    /// Live microphone roles. These get a capture requested when none is supplied.
    pub fn needs_capture(self) -> bool {
        matches!(self, SourceKind::Host | SourceKind::Guest)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Host => "host",
            SourceKind::Guest => "guest",
            SourceKind::Caller => "caller",
            SourceKind::Music => "music",
            SourceKind::Effects => "effects",
        }
    }
}

/// Everything needed to add a source to the mix.
pub struct SourceDescriptor {
    pub id: String,
    pub kind: SourceKind,
    pub display_name: String,
    pub volume: f32,
    pub muted: bool,
    pub priority: i32,
    /// Bulk multiplier applied on top of volume and mute.
    pub role_gain: f32,
    /// Pre-attached stream (remote caller, music bed). Hosts and guests
    /// without one get a live capture from the runtime.
    pub capture: Option<Box<dyn CaptureStream>>,
}

impl SourceDescriptor {
    pub fn new(id: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            display_name: String::new(),
            volume: 1.0,
            muted: false,
            priority: 0,
            role_gain: 1.0,
            capture: None,
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
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

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn role_gain(mut self, gain: f32) -> Self {
        self.role_gain = gain;
        self
    }

    pub fn capture(mut self, capture: Box<dyn CaptureStream>) -> Self {
        self.capture = Some(capture);
        self
    }
}

impl std::fmt::Debug for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("volume", &self.volume)
            .field("muted", &self.muted)
            .field("role_gain", &self.role_gain)
            .field("has_capture", &self.capture.is_some())
            .finish()
    }
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourcePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing)]
    pub role_gain: Option<f32>,
}

/// Read-only view of a mixed source.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub id: String,
    pub kind: SourceKind,
    pub display_name: String,
    pub volume: f32,
    pub muted: bool,
    pub active: bool,
    pub priority: i32,
    #[serde(skip)]
    pub role_gain: f32,
}

impl SourceInfo {
    /// `volume × (muted ? 0 : 1) × role_gain`, clamped to the unit range.
    pub fn effective_gain(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            unit_gain(unit_gain(self.volume) * unit_gain(self.role_gain))
        }
    }

    pub(crate) fn apply(&mut self, patch: &SourcePatch) -> bool {
        let before = self.effective_gain();
        if let Some(name) = &patch.display_name {
            self.display_name = name.clone();
        }
        if let Some(volume) = patch.volume {
            self.volume = unit_gain(volume);
        }
        if let Some(muted) = patch.muted {
            self.muted = muted;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(role_gain) = patch.role_gain {
            self.role_gain = unit_gain(role_gain);
        }
        self.effective_gain() != before
    }
}
