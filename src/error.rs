//! Error types for the media stream engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Ticker error: {0}")]
    Ticker(#[from] TickerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("SRTP error: {0}")]
    Srtp(#[from] SrtpError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid stream state: {0}")]
    InvalidState(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Filter and filter-graph errors
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Method {method} not supported by {filter}")]
    MethodNotSupported {
        filter: &'static str,
        method: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Port {port} out of range for {filter}")]
    InvalidPort { filter: &'static str, port: usize },

    #[error("Port {port} of {filter} is already linked")]
    AlreadyLinked { filter: &'static str, port: usize },

    #[error("Filter {0} does not belong to this graph")]
    UnknownFilter(&'static str),

    #[error("Graph contains a cycle")]
    CycleDetected,

    #[error("Render target error: {0}")]
    RenderTarget(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Conversion context unavailable: {0}")]
    Conversion(String),

    #[error("Filter {0} halted after a fatal error")]
    Halted(&'static str),

    #[error("Filter {0} already destroyed")]
    Destroyed(&'static str),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl FilterError {
    /// Whether the error must halt the filter instance
    pub fn is_fatal(&self) -> bool {
        matches!(self, FilterError::Conversion(_) | FilterError::Halted(_))
    }
}

/// Ticker errors
#[derive(Error, Debug)]
pub enum TickerError {
    #[error("Failed to spawn ticker thread: {0}")]
    SpawnFailed(String),

    #[error("Graph is already attached to a ticker")]
    AlreadyAttached,

    #[error("Graph is not attached to this ticker")]
    NotAttached,

    #[error("Ticker thread has stopped")]
    Stopped,

    #[error("Undefined priority {0}")]
    InvalidPriority(String),

    #[error("Failed to set thread priority: {0}")]
    Priority(String),
}

/// RTP/RTCP transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("No remote address set")]
    NoRemoteAddress,

    #[error("Address resolution failed: {0}")]
    Resolve(String),

    #[error("Socket option failed: {0}")]
    SocketOption(String),

    #[error("SRTP: {0}")]
    Srtp(#[from] SrtpError),

    #[error("Session is closed")]
    Closed,
}

/// SRTP errors
#[derive(Error, Debug)]
pub enum SrtpError {
    #[error("SRTP support not enabled")]
    NotSupported,

    #[error("Invalid master key: {0}")]
    InvalidKey(String),

    #[error("Unknown crypto suite: {0}")]
    UnknownSuite(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("SSRC {0:#010x} not covered by the outbound policy")]
    SsrcMismatch(u32),

    #[error("A secure transport is already attached")]
    AlreadyAttached,
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
