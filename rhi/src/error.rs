//! RHI error types.

use crate::backend::BackendKind;

/// Errors returned by context creation and resource `create()` calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RhiError {
    /// The requested backend is not compiled in or has no native implementation.
    #[error("backend {0:?} is not available")]
    BackendUnavailable(BackendKind),
    /// Failed to initialize the backend.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    /// Failed to create a resource.
    #[error("resource creation failed: {0}")]
    ResourceCreationFailed(String),
    /// A requested feature is not supported.
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Out of GPU memory.
    #[error("out of GPU memory")]
    OutOfMemory,
    /// The GPU device was lost.
    #[error("GPU device lost")]
    DeviceLost,
    /// The owning context has been dropped.
    #[error("the owning RHI context no longer exists")]
    ContextLost,
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors returned by frame operations.
///
/// `SwapChainOutOfDate` is recoverable: call
/// [`SwapChain::create_or_resize`](crate::SwapChain::create_or_resize) and try
/// again. `DeviceLost` is fatal for the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum FrameOpError {
    #[error("frame operation failed")]
    Error,
    #[error("swapchain is out of date")]
    SwapChainOutOfDate,
    #[error("GPU device lost")]
    DeviceLost,
}

/// Result of a frame operation.
pub type FrameOpResult = Result<(), FrameOpError>;

impl From<RhiError> for FrameOpError {
    fn from(err: RhiError) -> Self {
        match err {
            RhiError::DeviceLost => Self::DeviceLost,
            _ => Self::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RhiError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = RhiError::InitializationFailed("no GPU found".to_string());
        assert_eq!(err.to_string(), "initialization failed: no GPU found");

        let err = RhiError::BackendUnavailable(BackendKind::Metal);
        assert_eq!(err.to_string(), "backend Metal is not available");
    }

    #[test]
    fn test_frame_op_error_from_rhi_error() {
        assert_eq!(FrameOpError::from(RhiError::DeviceLost), FrameOpError::DeviceLost);
        assert_eq!(FrameOpError::from(RhiError::OutOfMemory), FrameOpError::Error);
    }
}
