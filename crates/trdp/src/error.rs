//! Error types for TRDP operations.

use std::io;

/// Result type for TRDP operations.
pub type Result<T> = std::result::Result<T, TrdpError>;

/// Errors that can occur during TRDP operations.
#[derive(Debug, thiserror::Error)]
pub enum TrdpError {
    /// Invalid parameter passed to a public entry point.
    #[error("invalid parameter: {0}")]
    Param(String),

    /// Stack or subsystem initialisation failed.
    #[error("initialisation failed: {0}")]
    Init(String),

    /// The session handle is closed or was never opened.
    #[error("session not initialised")]
    NoInit,

    /// The telegram memory budget is exhausted.
    #[error("out of telegram memory: requested {requested} bytes, {available} available")]
    Mem {
        /// Bytes requested (bin-rounded).
        requested: usize,
        /// Bytes still available in the pool.
        available: usize,
    },

    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No data available (empty read, closed peer).
    #[error("no data")]
    NoData,

    /// A deadline expired (receive timeout, reply timeout).
    #[error("timeout")]
    Timeout,

    /// Frame check sequence mismatch.
    #[error("frame check error in {span}")]
    Crc {
        /// Which span failed: `"header"` or `"body"`.
        span: &'static str,
    },

    /// Malformed frame: bad length, version or message type.
    #[error("wire error at offset {offset}: {detail}")]
    Wire {
        /// Byte offset of the offending field within the frame.
        offset: usize,
        /// What was wrong with it.
        detail: String,
    },

    /// Frame topography counters do not match the session.
    #[error("topo count mismatch: frame {frame:?}, local {local:?}")]
    Topo {
        /// `(etbTopoCount, opTrnTopoCount)` carried by the frame.
        frame: (u32, u32),
        /// `(etbTopoCount, opTrnTopoCount)` of the session.
        local: (u32, u32),
    },

    /// ComId is not present in the marshalling tables.
    #[error("unknown comId {0}")]
    ComId(u32),

    /// The publication handle is not in the send table.
    #[error("not published")]
    NoPublish,

    /// The subscription handle is not in the receive table.
    #[error("not subscribed")]
    NoSubscribe,

    /// No listener matches an ingress message data frame.
    #[error("no listener")]
    NoListener,

    /// The operation would block (TCP connect or send in progress).
    #[error("operation would block")]
    Block,
}

impl TrdpError {
    /// Create a parameter error from anything printable.
    pub fn param(detail: impl Into<String>) -> Self {
        Self::Param(detail.into())
    }

    /// Create a wire error pinned to a frame offset.
    pub fn wire(offset: usize, detail: impl Into<String>) -> Self {
        Self::Wire {
            offset,
            detail: detail.into(),
        }
    }

    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check if this is a frame check failure.
    pub fn is_crc(&self) -> bool {
        matches!(self, Self::Crc { .. })
    }

    /// Check if this is a malformed-frame error.
    pub fn is_wire(&self) -> bool {
        matches!(self, Self::Wire { .. })
    }

    /// Check if this error is transient: the affected entry stays
    /// registered and the operation retries on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Block | Self::NoData)
    }

    /// The result code delivered to callbacks for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            Self::Timeout => ResultCode::Timeout,
            Self::Crc { .. } => ResultCode::CrcError,
            Self::Wire { .. } => ResultCode::WireError,
            Self::Topo { .. } => ResultCode::TopoError,
            Self::Io(_) | Self::Block => ResultCode::IoError,
            Self::NoData => ResultCode::NoData,
            _ => ResultCode::Error,
        }
    }
}

/// Result code delivered with asynchronous events.
///
/// Synchronous entry points return [`TrdpError`]; events handed to
/// callbacks carry one of these instead, since the same subscription or
/// session may see many of them over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Valid data received.
    Ok,
    /// The supervision interval elapsed without a valid frame.
    Timeout,
    /// A replier did not confirm within its confirm timeout.
    ConfirmTimeout,
    /// Frame check sequence mismatch on an ingress frame.
    CrcError,
    /// Malformed ingress frame.
    WireError,
    /// Stale topography counters on an ingress frame.
    TopoError,
    /// Socket-level failure.
    IoError,
    /// Peer closed the connection.
    NoData,
    /// Unclassified failure.
    Error,
}

impl ResultCode {
    /// Check if the event carries valid data.
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(TrdpError::Timeout.is_timeout());
        assert!(TrdpError::Crc { span: "header" }.is_crc());
        assert!(TrdpError::wire(6, "bad message type").is_wire());
        assert!(!TrdpError::NoPublish.is_timeout());
    }

    #[test]
    fn test_transient() {
        assert!(TrdpError::Block.is_transient());
        assert!(TrdpError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_transient());
        assert!(!TrdpError::NoInit.is_transient());
    }

    #[test]
    fn test_result_codes() {
        assert_eq!(TrdpError::Timeout.code(), ResultCode::Timeout);
        assert_eq!(TrdpError::Crc { span: "body" }.code(), ResultCode::CrcError);
        assert_eq!(
            TrdpError::Topo {
                frame: (4, 0),
                local: (5, 0)
            }
            .code(),
            ResultCode::TopoError
        );
        assert!(ResultCode::Ok.is_ok());
        assert!(!ResultCode::Timeout.is_ok());
    }

    #[test]
    fn test_error_messages() {
        let err = TrdpError::wire(20, "dataset length 2000 exceeds maximum");
        assert_eq!(
            err.to_string(),
            "wire error at offset 20: dataset length 2000 exceeds maximum"
        );

        let err = TrdpError::ComId(4242);
        assert_eq!(err.to_string(), "unknown comId 4242");

        let err = TrdpError::Mem {
            requested: 2048,
            available: 512,
        };
        assert!(err.to_string().contains("2048"));
    }
}
