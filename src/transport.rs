//! QUIC endpoint construction and stream-identifier helpers.
//!
//! One QUIC connection carries everything: a bidirectional stream per
//! FTP sub-connection for commands, and a server-initiated
//! unidirectional stream per data transfer. Data streams are referred
//! to by their raw wire ID, which the server echoes in reply text.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicClientConfig;
use quinn::{Connection, Endpoint, TransportConfig, VarInt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::tls;

/// ALPN token spoken on the wire.
pub const ALPN: &[u8] = b"qftp";

/// Per-direction stream budget, like the vsftpd per-session default.
pub const MAX_STREAMS_PER_SESSION: u32 = 3;

/// Per-stream receive window, sized like the OpenSuse tcp_rmem maximum.
pub const MAX_STREAM_FLOW_CONTROL: u32 = 6 * 1024 * 1024;

/// Transport knobs applied to every session.
#[derive(Debug, Clone)]
pub struct QuicSettings {
    pub handshake_timeout: Option<Duration>,
    pub max_incoming_uni_streams: u32,
    pub max_incoming_bidi_streams: u32,
    pub stream_receive_window: u32,
    pub connection_receive_window: u32,
    pub keep_alive_interval: Option<Duration>,
    pub idle_timeout: Duration,
}

impl Default for QuicSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: None,
            max_incoming_uni_streams: MAX_STREAMS_PER_SESSION,
            max_incoming_bidi_streams: MAX_STREAMS_PER_SESSION,
            stream_receive_window: MAX_STREAM_FLOW_CONTROL,
            // one extra window's worth of headroom for the control streams
            connection_receive_window: MAX_STREAM_FLOW_CONTROL * (MAX_STREAMS_PER_SESSION + 1),
            keep_alive_interval: Some(Duration::from_secs(15)),
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl QuicSettings {
    fn transport_config(&self) -> TransportConfig {
        let mut transport = TransportConfig::default();
        transport.max_concurrent_uni_streams(VarInt::from_u32(self.max_incoming_uni_streams));
        transport.max_concurrent_bidi_streams(VarInt::from_u32(self.max_incoming_bidi_streams));
        transport.stream_receive_window(VarInt::from_u32(self.stream_receive_window));
        transport.receive_window(VarInt::from_u32(self.connection_receive_window));
        transport.keep_alive_interval(self.keep_alive_interval);
        transport
            .max_idle_timeout(Some(VarInt::from_u32(self.idle_timeout.as_millis() as u32).into()));
        transport
    }
}

/// Dials `addr` (`host:port`) trusting only the certificate in
/// `certfile`. Returns the endpoint alongside the connection; the
/// endpoint must stay alive as long as any stream is in use.
pub async fn dial(
    addr: &str,
    certfile: &Path,
    settings: &QuicSettings,
) -> Result<(Endpoint, Connection)> {
    let remote = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| Error::Config(format!("could not resolve {addr}")))?;
    let server_name = host_part(addr)?;

    let mut crypto = tls::client_config(certfile)?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(crypto)?));
    config.transport_config(Arc::new(settings.transport_config()));

    let bind: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint = Endpoint::client(bind)?;
    endpoint.set_default_client_config(config);

    debug!(%remote, %server_name, "dialing");
    let connecting = endpoint.connect(remote, &server_name)?;
    let connection = match settings.handshake_timeout {
        Some(limit) => tokio::time::timeout(limit, connecting)
            .await
            .map_err(|_| Error::HandshakeTimeout)??,
        None => connecting.await?,
    };
    Ok((endpoint, connection))
}

/// Splits the host out of a `host:port` pair, unwrapping IPv6 brackets.
fn host_part(addr: &str) -> Result<String> {
    let (host, _) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("address {addr:?} is not host:port")))?;
    Ok(host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string())
}

/// Raw wire value of a stream ID.
pub fn raw_id(id: quinn::StreamId) -> u64 {
    VarInt::from(id).into_inner()
}

/// Whether a raw ID names a server-initiated unidirectional stream,
/// the only kind a data stream may arrive on.
pub fn is_server_uni(id: u64) -> bool {
    id % 4 == 3
}
