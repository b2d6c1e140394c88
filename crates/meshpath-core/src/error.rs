//! Core error types.

/// Errors from PANN frame decoding.
///
/// A frame that fails to decode is dropped by the engine without a response;
/// the variants exist so the drop reason is loggable and countable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("malformed frame: {unknown} unknown fields exceed tolerance of {tolerated}")]
    UnknownFields { unknown: usize, tolerated: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_error_display() {
        let err = FrameError::Malformed("expected map");
        assert_eq!(err.to_string(), "malformed frame: expected map");

        let err = FrameError::UnknownFields {
            unknown: 5,
            tolerated: 2,
        };
        assert_eq!(
            err.to_string(),
            "malformed frame: 5 unknown fields exceed tolerance of 2"
        );
    }
}
