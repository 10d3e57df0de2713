/// Why a live capture could not be acquired. Never retried automatically;
/// each variant needs a different action from the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("Microphone access was denied. Allow access in your browser or OS settings and try again")]
    PermissionDenied,
    #[error("No microphone was found. Connect an input device and try again")]
    DeviceNotFound,
    #[error("Could not start audio capture: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MixerError {
    #[error("The mix already has the maximum of {0} sources")]
    CapacityExceeded(usize),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("Audio source {0} does not exist")]
    SourceNotFound(String),
    #[error("Audio source {0} already exists")]
    DuplicateSource(String),
    #[error("The audio context has been closed")]
    ContextClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StudioError {
    #[error("The studio already has the maximum of {limit} {role}s")]
    RoleCapacityExceeded { role: &'static str, limit: usize },
    #[error("Add at least one host before going live")]
    NoHostPresent,
    #[error("The broadcast is already live")]
    AlreadyLive,
    #[error("The studio has not been initialized")]
    NotInitialized,
    #[error(transparent)]
    Mixer(#[from] MixerError),
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Could not reach the broadcast gateway: {0}")]
    Connect(String),
    #[error("The gateway link is not connected")]
    Closed,
    #[error("Could not encode gateway message: {0}")]
    Encode(#[from] serde_json::Error),
}
