//! Routing layer error types.

use meshpath_core::error::FrameError;

use crate::fib::FibError;

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("fib error: {0}")]
    Fib(#[from] FibError),

    #[error("routing service channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_error_display() {
        let err = RoutingError::ChannelClosed;
        assert_eq!(err.to_string(), "routing service channel closed");

        let err: RoutingError = FrameError::Malformed("expected map").into();
        assert_eq!(err.to_string(), "frame error: malformed frame: expected map");
    }
}
