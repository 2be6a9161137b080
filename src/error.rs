//! Error type shared across the client.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Dial-time failure before a connection existed.
    #[error("connect failed: {0}")]
    Connect(#[from] quinn::ConnectError),

    /// The QUIC connection died under us.
    #[error("connection lost: {0}")]
    Connection(#[from] quinn::ConnectionError),

    /// A stream was finished or reset while we still needed it.
    #[error("stream closed: {0}")]
    Closed(#[from] quinn::ClosedStream),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error("tls: {0}")]
    Crypto(#[from] quinn::crypto::rustls::NoInitialCipherSuite),

    #[error("certificate file: {0}")]
    Pem(#[from] rustls_pki_types::pem::Error),

    #[error("{0}")]
    Config(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The server answered with a reply code we did not expect.
    #[error("server replied {code} {message:?}")]
    UnexpectedReply { code: i32, message: String },

    /// The server sent something we could not make sense of.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A data stream with an ID above the awaited one arrived, so the
    /// awaited stream can no longer show up.
    #[error("data stream {id} will not arrive (stream {seen} was accepted)")]
    LostStream { id: u64, seen: u64 },

    /// Combined failures of a parallel transfer run.
    #[error("{0}")]
    Aggregate(String),
}
