use thiserror::Error;

/// Reasons a connection handshake or in-session policy violation ends a
/// connection. Maps 1:1 to a transport-level disconnect reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    BadVersion,
    DuplicateId,
    BadLogin,
    InvalidUsername,
    FloodControl,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::BadVersion => "BadVersion",
            DisconnectReason::DuplicateId => "DuplicateId",
            DisconnectReason::BadLogin => "BadLogin",
            DisconnectReason::InvalidUsername => "InvalidUsername",
            DisconnectReason::FloodControl => "FloodControl",
        }
    }
}

/// Textual reasons carried in rendezvous rejection payloads.
pub mod rejection {
    pub const NO_SUCH_HOST: &str = "Could not find specified host";
    pub const REQUEST_TIMED_OUT: &str = "Server did not respond to connection request";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unreachable")]
    CantConnect,
    #[error("backend does not support this operation")]
    Unsupported,
    #[error("backend error: {0}")]
    Backend(String),
}
