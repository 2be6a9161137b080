//! qftp - FTP over QUIC
//!
//! Client for RFC 959 FTP re-hosted on a multiplexed QUIC transport.
//! One authenticated QUIC session carries any number of FTP
//! sub-connections: each gets a bidirectional control stream, and every
//! transfer gets its own unidirectional data stream whose ID is threaded
//! through the FTP reply text instead of a PASV/PORT address.

pub mod engine;
pub mod entry;
pub mod error;
pub mod reply;
pub mod session;
pub mod status;
pub mod sub_conn;
pub mod tls;
pub mod transport;

pub use engine::{Direction, TransferTask};
pub use entry::{Entry, EntryKind};
pub use error::{Error, Result};
pub use session::Session;
pub use sub_conn::{DataReader, SubConn};
