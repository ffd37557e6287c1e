use thiserror::Error;

/// 流送系统的错误分类
///
/// 需要 `Clone`：worker 线程产生的错误会被放进 command 里送回主线程，
/// 并且可能被转发给多个 listener。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamingError {
    #[error("resource '{name}' not found in group '{group}'")]
    ResourceNotFound { name: String, group: String },

    #[error("failed to decode '{name}': {reason}")]
    Decode { name: String, reason: String },

    #[error("texture '{name}': {reason}")]
    InvalidState { name: String, reason: String },

    #[error("texture handle does not exist (already destroyed?)")]
    UnknownTexture,

    #[error("a texture with alias '{0}' already exists")]
    DuplicateAlias(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("texture '{name}': expected {expected}, loaded {actual}")]
    ShapeMismatch { name: String, expected: String, actual: String },

    #[error("metadata cache: {0}")]
    MetadataCache(String),
}

impl StreamingError {
    pub fn invalid_state(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
