use microproto_core::ProtoError;
use microproto_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry is sealed; properties can only be registered before serving")]
    Sealed,

    #[error("outbound queue full")]
    QueueFull,

    #[error("engine task is gone")]
    EngineClosed,
}

impl EngineError {
    /// The underlying protocol error, if any.
    pub fn as_proto(&self) -> Option<&ProtoError> {
        match self {
            Self::Proto(e) => Some(e),
            _ => None,
        }
    }
}
