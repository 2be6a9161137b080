//! A QUIC session to one FTP server, and the client facade over it.
//!
//! The session owns the endpoint, the connection and the map of
//! accepted-but-unclaimed server data streams. Sub-connections hold
//! cheap connection clones plus a shared handle on that map; the
//! session stays the single owner of the transport.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quinn::{Connection, Endpoint, RecvStream, VarInt};
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::engine::{self, TransferTask};
use crate::entry::Entry;
use crate::error::Result;
use crate::sub_conn::{DataReader, SubConn};
use crate::transport::{self, QuicSettings};

/// Server data streams accepted but not yet claimed by any
/// sub-connection, keyed by raw stream ID. The mutex doubles as the
/// session lock for stream opens.
pub(crate) type PendingStreams = Arc<Mutex<HashMap<u64, RecvStream>>>;

#[derive(Clone)]
pub(crate) struct Credentials {
    pub user: String,
    pub password: String,
}

pub struct Session {
    endpoint: Endpoint,
    pub(crate) connection: Connection,
    pub(crate) pending: PendingStreams,
    pub(crate) main: SubConn,
    pub(crate) credentials: Option<Credentials>,
}

impl Session {
    /// Connects to `addr` (`host:port`), trusting only the PEM
    /// certificate at `certfile`, and prepares the default
    /// sub-connection. Most commands require a [`Session::login`] first.
    pub async fn dial(
        addr: &str,
        certfile: &Path,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let settings = QuicSettings {
            handshake_timeout: timeout,
            ..QuicSettings::default()
        };
        let (endpoint, connection) = transport::dial(addr, certfile, &settings).await?;
        let pending: PendingStreams = Arc::new(Mutex::new(HashMap::new()));

        let mut main = open_sub(&connection, &pending).await?;
        if let Err(err) = main.feat().await {
            let _ = main.quit().await;
            return Err(err);
        }
        info!(addr, "session established");

        Ok(Self {
            endpoint,
            connection,
            pending,
            main,
            credentials: None,
        })
    }

    /// Opens a fresh sub-connection on the same QUIC session. The caller
    /// must log it in before issuing commands.
    pub async fn new_sub(&self) -> Result<SubConn> {
        open_sub(&self.connection, &self.pending).await
    }

    /// Authenticates the default sub-connection and caches the
    /// credentials for sub-connections spawned by parallel transfers.
    pub async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        self.main.login(user, password).await?;
        self.credentials = Some(Credentials {
            user: user.to_string(),
            password: password.to_string(),
        });
        Ok(())
    }

    /// Re-runs FEAT on the default sub-connection.
    pub async fn feat(&mut self) -> Result<()> {
        self.main.feat().await
    }

    /// Features advertised by the server's last FEAT reply.
    pub fn features(&self) -> &HashMap<String, String> {
        self.main.features()
    }

    /// NLST: raw names under `path`.
    pub async fn name_list(&mut self, path: &str) -> Result<Vec<String>> {
        self.main.name_list(path).await
    }

    /// LIST: parsed entries under `path`.
    pub async fn list(&mut self, path: &str) -> Result<Vec<Entry>> {
        self.main.list(path).await
    }

    /// CWD.
    pub async fn change_dir(&mut self, path: &str) -> Result<()> {
        self.main.change_dir(path).await
    }

    /// CDUP.
    pub async fn change_dir_to_parent(&mut self) -> Result<()> {
        self.main.change_dir_to_parent().await
    }

    /// PWD.
    pub async fn current_dir(&mut self) -> Result<String> {
        self.main.current_dir().await
    }

    /// RETR: drain the reader, then call [`DataReader::finish`].
    pub async fn retr(&mut self, path: &str) -> Result<DataReader<'_>> {
        self.main.retr(path).await
    }

    /// RETR skipping the first `offset` bytes.
    pub async fn retr_from(&mut self, path: &str, offset: u64) -> Result<DataReader<'_>> {
        self.main.retr_from(path, offset).await
    }

    /// STOR the content of `src` as `path`.
    pub async fn stor<R>(&mut self, path: &str, src: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.main.stor(path, src).await
    }

    /// STOR with the server writing from `offset` on.
    pub async fn stor_from<R>(&mut self, path: &str, src: &mut R, offset: u64) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.main.stor_from(path, src, offset).await
    }

    /// Runs `tasks` over up to `nr_parallel` sub-connections sharing
    /// this session; negative means one per task. See [`TransferTask`].
    pub async fn multiple_transfer(
        &mut self,
        tasks: Vec<TransferTask>,
        nr_parallel: i32,
    ) -> Result<()> {
        engine::multiple_transfer(self, tasks, nr_parallel).await
    }

    /// RNFR/RNTO.
    pub async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.main.rename(from, to).await
    }

    /// DELE.
    pub async fn delete(&mut self, path: &str) -> Result<()> {
        self.main.delete(path).await
    }

    /// MKD.
    pub async fn make_dir(&mut self, path: &str) -> Result<()> {
        self.main.make_dir(path).await
    }

    /// RMD.
    pub async fn remove_dir(&mut self, path: &str) -> Result<()> {
        self.main.remove_dir(path).await
    }

    /// NOOP.
    pub async fn noop(&mut self) -> Result<()> {
        self.main.noop().await
    }

    /// REIN.
    pub async fn logout(&mut self) -> Result<()> {
        self.main.logout().await
    }

    /// Sends QUIT on the default sub-connection, closes the QUIC
    /// connection and waits for the endpoint to drain.
    pub async fn quit(mut self) -> Result<()> {
        let result = self.main.quit().await;
        self.connection.close(VarInt::from_u32(0), b"");
        self.endpoint.wait_idle().await;
        debug!("session closed");
        result
    }
}

/// Opens a control stream under the session lock and wraps it in a
/// sub-connection.
pub(crate) async fn open_sub(connection: &Connection, pending: &PendingStreams) -> Result<SubConn> {
    let guard = pending.lock().await;
    let (send, recv) = connection.open_bi().await?;
    drop(guard);
    Ok(SubConn::new(connection.clone(), pending.clone(), send, recv))
}
