//! Error types traded throughout the relay: one [`Error`] enum covering
//! protocol, auth, lifecycle, timeout, and I/O failures, one [`Result`]
//! alias, boilerplate derived with `thiserror`.

/// Wrapper result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type used throughout the relay.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Frame shorter than the minimum for its type, or an unknown message
    /// type byte. Always session-fatal, never process-fatal.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// A message type was received that isn't valid in the current
    /// protocol state (e.g. a second Hello on an established session).
    #[error("unexpected message type: {0}")]
    UnexpectedMessageType(&'static str),

    /// The protocol version on a *handshake* frame didn't match
    /// [`crate::relay::CURRENT_PROTOCOL_VERSION`]. Unlike other frame
    /// types (which are processed leniently), a version mismatch at
    /// handshake time is always rejected.
    #[error("unsupported protocol version at handshake: {0}")]
    ProtocolVersionMismatch(u8),

    /// HMAC signature mismatch.
    #[error("auth token signature invalid")]
    AuthInvalid,

    /// HMAC signature valid but the token's expiry has passed.
    #[error("auth token expired")]
    AuthExpired,

    /// `open_conn` / `write` called before a successful `connect`.
    #[error("relay client is not connected")]
    NotConnected,

    /// `open_conn` called for a peer ID that already has an open
    /// virtual connection.
    #[error("connection to peer already exists")]
    AlreadyExists,

    /// Handshake read, graceful-close write, or health-check deadline
    /// elapsed.
    #[error("operation timed out")]
    Timeout,

    /// Operation attempted on a closed virtual conn or shut-down link.
    #[error("connection is closed")]
    Closed,

    /// Wrapped I/O error from the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped WebSocket-layer error (client side, over `tokio-tungstenite`).
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Wrapped WebSocket-layer error (server side, over axum's upgraded
    /// socket).
    #[error("websocket error: {0}")]
    AxumWebSocket(#[from] axum::Error),

    /// Configuration could not be parsed or was internally inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A `Conn::write` payload would marshal to a `Transport` frame larger
    /// than [`crate::relay::BUFFER_SIZE`].
    #[error("payload of {0} bytes exceeds the maximum of {1}")]
    PayloadTooLarge(usize, usize),
}

impl Error {
    /// Short, stable tag for metrics/log fields, independent of the
    /// human-readable `Display` message.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MalformedFrame(_) => "malformed_frame",
            Error::UnexpectedMessageType(_) => "unexpected_message_type",
            Error::ProtocolVersionMismatch(_) => "protocol_version_mismatch",
            Error::AuthInvalid => "auth_invalid",
            Error::AuthExpired => "auth_expired",
            Error::NotConnected => "not_connected",
            Error::AlreadyExists => "already_exists",
            Error::Timeout => "timeout",
            Error::Closed => "closed",
            Error::Io(_) => "io",
            Error::WebSocket(_) => "websocket",
            Error::AxumWebSocket(_) => "websocket",
            Error::Config(_) => "config",
            Error::PayloadTooLarge(..) => "payload_too_large",
        }
    }
}
