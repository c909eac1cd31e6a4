use std::io;

/// Error surface of the service layer. The control wrapper renders these as
/// `ERR <message>` replies; the proxy re-derives the variant from the stable
/// message prefix on the way back.
#[derive(Debug, thiserror::Error)]
pub enum EtdError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// This service's UUID already owns a transfer.
    #[error("already busy: {0}")]
    AlreadyBusy(String),

    /// The normalized target path is registered in an incompatible mode.
    #[error("path conflict: {0}")]
    PathConflict(String),

    #[error("i/o error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("all data addresses failed: {0}")]
    AllAddressesFailed(String),

    #[error("short read: {0}")]
    ShortRead(String),

    #[error("short write: {0}")]
    ShortWrite(String),
}

pub type Result<T> = std::result::Result<T, EtdError>;

impl EtdError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        EtdError::Io {
            context: context.into(),
            source,
        }
    }

    /// Rebuild the error a remote peer reported in an `ERR` reply. The reply
    /// payload is the `Display` form of the remote error, so the variant can
    /// be recovered from its prefix; anything unrecognized is surfaced as a
    /// remote i/o error with the message preserved.
    pub fn from_remote(msg: &str) -> Self {
        fn remote_io(detail: String) -> EtdError {
            EtdError::Io {
                context: "remote".to_string(),
                source: io::Error::new(io::ErrorKind::Other, detail),
            }
        }
        const KINDS: &[(&str, fn(String) -> EtdError)] = &[
            ("invalid argument: ", EtdError::InvalidArgument),
            ("already busy: ", EtdError::AlreadyBusy),
            ("path conflict: ", EtdError::PathConflict),
            ("i/o error: ", remote_io),
            ("protocol error: ", EtdError::Protocol),
            ("all data addresses failed: ", EtdError::AllAddressesFailed),
            ("short read: ", EtdError::ShortRead),
            ("short write: ", EtdError::ShortWrite),
        ];
        for (prefix, mk) in KINDS {
            if let Some(rest) = msg.strip_prefix(prefix) {
                return mk(rest.to_string());
            }
        }
        remote_io(msg.to_string())
    }
}
