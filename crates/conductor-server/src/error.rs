use conductor_core::ids::{StreamId, SubscriberId};

/// Failures of the live subscription surface.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream session not found: {0}")]
    SessionNotFound(String),

    #[error("stream session {0} is closed")]
    SessionClosed(StreamId),

    /// The subscriber's channel is full; the event was dropped for it.
    #[error("subscriber {0} is not keeping up")]
    SubscriberFull(SubscriberId),
}

impl StreamError {
    /// Status code for the HTTP surface.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::SessionNotFound(_) => 404,
            Self::SessionClosed(_) => 410,
            Self::SubscriberFull(_) => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_session() {
        let err = StreamError::SessionClosed(StreamId::from_raw("strm_1"));
        assert_eq!(err.to_string(), "stream session strm_1 is closed");
        assert_eq!(err.status_code(), 410);
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(StreamError::SessionNotFound("req_x".into()).status_code(), 404);
    }
}
