use thiserror::Error;

use crate::camera::CameraId;

/// Failure modes of the lighting core.
///
/// Per-light and per-camera variants are recoverable and are handled inside the
/// pipeline; the rest indicate a programming error (a kernel would read or write
/// memory it was not sized for) and abort the camera with an error.
#[derive(Debug, Error)]
pub enum LightingError {
    #[error("camera {camera:?} has no usable frustum: {reason}")]
    DegenerateCamera { camera: CameraId, reason: &'static str },

    #[error("light {light} cannot cast shadows this frame: {reason}")]
    ShadowUnavailable { light: usize, reason: &'static str },

    #[error("buffer '{label}' holds {actual} bytes but the kernel expects {expected}")]
    BufferSizeMismatch { label: &'static str, expected: u64, actual: u64 },

    #[error("'{label}' was read before the dispatch that wrote it was synchronized")]
    MissingBarrier { label: &'static str },

    #[error("cluster culling expected stage {expected:?} but was {found:?}")]
    InvalidCullStage { expected: crate::clusters::CullStage, found: crate::clusters::CullStage },

    #[error("unknown buffer handle {0}")]
    UnknownBuffer(u32),

    #[error("unknown texture handle {0}")]
    UnknownTexture(u32),
}

impl LightingError {
    /// True for errors the pipeline swallows after skipping the affected light or camera.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LightingError::DegenerateCamera { .. } | LightingError::ShadowUnavailable { .. })
    }
}
