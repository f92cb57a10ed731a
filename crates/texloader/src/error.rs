/// Message produced by an [`ImageDecoder`](crate::ImageDecoder).
///
/// The text is surfaced to callers verbatim, so decoders should phrase it for humans.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Everything that can end a load request without a texture.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("image data is corrupted or unsupported")]
    UnsupportedFormat,
    #[error("{0}")]
    PlatformUnsupported(String),
    #[error("precondition violated: {0}")]
    Precondition(String),
    #[error("texture upload failed: {0}")]
    Upload(String),
    /// A collaborator panicked while handling this request; the worker keeps running.
    #[error("image pipeline panicked: {0}")]
    Panicked(String),
    #[error("load pipeline was interrupted before producing a result")]
    Interrupted,
}

impl LoadError {
    /// Per-request failures leave the worker running; everything else points at
    /// misuse or shutdown.
    pub fn is_per_request(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::UnsupportedFormat | Self::Upload(_) | Self::Panicked(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_message_is_passed_through() {
        let error = LoadError::from(DecodeError::new("invalid header"));
        assert_eq!(error.to_string(), "invalid header");
        assert!(error.is_per_request());
    }

    #[test]
    fn unsupported_format_uses_fixed_message() {
        assert_eq!(
            LoadError::UnsupportedFormat.to_string(),
            "image data is corrupted or unsupported"
        );
        assert!(!LoadError::Interrupted.is_per_request());
    }
}
