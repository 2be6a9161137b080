//! One FTP login context bound to one bidirectional QUIC control stream.
//!
//! Commands and replies travel over the control stream; each transfer
//! gets its own unidirectional data stream. Downloads rendezvous with
//! a server-opened stream whose ID arrives in the 125/150 reply text;
//! uploads open a stream locally and splice its ID into the command.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use quinn::{Connection, RecvStream, SendStream};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf};
use tracing::{debug, trace};

use crate::entry::{parse_list_line, Entry};
use crate::error::{Error, Result};
use crate::reply::Codec;
use crate::session::PendingStreams;
use crate::status;
use crate::transport::{is_server_uni, raw_id};

pub struct SubConn {
    connection: Connection,
    pending: PendingStreams,
    control: Codec<BufReader<RecvStream>, SendStream>,
    features: HashMap<String, String>,
}

impl SubConn {
    pub(crate) fn new(
        connection: Connection,
        pending: PendingStreams,
        send: SendStream,
        recv: RecvStream,
    ) -> Self {
        Self {
            connection,
            pending,
            control: Codec::new(BufReader::new(recv), send),
            features: HashMap::new(),
        }
    }

    /// Authenticates with `user`/`password`, switches to binary mode and
    /// refreshes the feature map. `anonymous`/`anonymous` is the common
    /// scheme for read-only accounts.
    pub async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let (code, message) = self.control.cmd(None, &format!("USER {user}")).await?;
        match code {
            status::LOGGED_IN => {}
            status::USER_OK => {
                self.control
                    .cmd(Some(status::LOGGED_IN), &format!("PASS {password}"))
                    .await?;
            }
            _ => return Err(Error::UnexpectedReply { code, message }),
        }

        self.control.cmd(Some(status::COMMAND_OK), "TYPE I").await?;

        // logged in, learn the feature set again
        if let Err(err) = self.feat().await {
            let _ = self.quit().await;
            return Err(err);
        }
        Ok(())
    }

    /// Issues FEAT (RFC 2389). A server without FEAT support is not an
    /// error; the feature map just comes back empty.
    pub async fn feat(&mut self) -> Result<()> {
        let (code, message) = self.control.cmd(None, "FEAT").await?;
        self.features.clear();
        if code != status::SYSTEM {
            return Ok(());
        }
        for line in message.split('\n') {
            if !line.starts_with(' ') {
                continue;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(' ') {
                Some((command, description)) => {
                    self.features
                        .insert(command.to_string(), description.to_string());
                }
                None => {
                    self.features.insert(line.to_string(), String::new());
                }
            }
        }
        Ok(())
    }

    /// Features advertised by the last FEAT exchange.
    pub fn features(&self) -> &HashMap<String, String> {
        &self.features
    }

    /// Issues NLST and returns the raw name lines.
    pub async fn name_list(&mut self, path: &str) -> Result<Vec<String>> {
        let stream = self.cmd_data_recv(format!("NLST {path}"), 0).await?;
        let (lines, read_err) = read_lines(stream).await;
        let close = self.finalize_transfer().await;
        if let Some(err) = read_err {
            return Err(err);
        }
        close?;
        Ok(lines)
    }

    /// Issues LIST and parses each line; lines in a format no parser
    /// understands are dropped.
    pub async fn list(&mut self, path: &str) -> Result<Vec<Entry>> {
        let stream = self.cmd_data_recv(format!("LIST {path}"), 0).await?;
        let (lines, read_err) = read_lines(stream).await;
        let close = self.finalize_transfer().await;
        if let Some(err) = read_err {
            return Err(err);
        }
        close?;
        Ok(lines
            .iter()
            .filter_map(|line| parse_list_line(line).ok())
            .collect())
    }

    /// Issues CWD.
    pub async fn change_dir(&mut self, path: &str) -> Result<()> {
        self.control
            .cmd(Some(status::REQUESTED_FILE_ACTION_OK), &format!("CWD {path}"))
            .await?;
        Ok(())
    }

    /// Issues CDUP, like `change_dir("..")`.
    pub async fn change_dir_to_parent(&mut self) -> Result<()> {
        self.control
            .cmd(Some(status::REQUESTED_FILE_ACTION_OK), "CDUP")
            .await?;
        Ok(())
    }

    /// Issues PWD and extracts the quoted path from the reply.
    pub async fn current_dir(&mut self) -> Result<String> {
        let (_, message) = self.control.cmd(Some(status::PATH_CREATED), "PWD").await?;
        match (message.find('"'), message.rfind('"')) {
            (Some(start), Some(end)) if start < end => Ok(message[start + 1..end].to_string()),
            _ => Err(Error::Protocol(format!(
                "unsupported PWD response {message:?}"
            ))),
        }
    }

    /// Issues RETR. Drain the returned reader, then call
    /// [`DataReader::finish`] to consume the closing reply.
    pub async fn retr(&mut self, path: &str) -> Result<DataReader<'_>> {
        self.retr_from(path, 0).await
    }

    /// Like [`SubConn::retr`], skipping the first `offset` bytes.
    pub async fn retr_from(&mut self, path: &str, offset: u64) -> Result<DataReader<'_>> {
        let stream = self.cmd_data_recv(format!("RETR {path}"), offset).await?;
        Ok(DataReader { stream, sub: self })
    }

    /// Issues STOR, writing the content of `src` to `path` on the server.
    pub async fn stor<R>(&mut self, path: &str, src: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.stor_from(path, src, 0).await
    }

    /// Like [`SubConn::stor`], with the server writing from `offset` on.
    pub async fn stor_from<R>(&mut self, path: &str, src: &mut R, offset: u64) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut stream = self.cmd_data_send(&format!("STOR {path}"), offset).await?;
        tokio::io::copy(src, &mut stream).await?;
        stream.finish()?;
        self.finalize_transfer().await
    }

    /// Renames `from` to `to` via RNFR/RNTO.
    pub async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.control
            .cmd(Some(status::REQUEST_FILE_PENDING), &format!("RNFR {from}"))
            .await?;
        self.control
            .cmd(Some(status::REQUESTED_FILE_ACTION_OK), &format!("RNTO {to}"))
            .await?;
        Ok(())
    }

    /// Issues DELE.
    pub async fn delete(&mut self, path: &str) -> Result<()> {
        self.control
            .cmd(
                Some(status::REQUESTED_FILE_ACTION_OK),
                &format!("DELE {path}"),
            )
            .await?;
        Ok(())
    }

    /// Issues MKD.
    pub async fn make_dir(&mut self, path: &str) -> Result<()> {
        self.control
            .cmd(Some(status::PATH_CREATED), &format!("MKD {path}"))
            .await?;
        Ok(())
    }

    /// Issues RMD.
    pub async fn remove_dir(&mut self, path: &str) -> Result<()> {
        self.control
            .cmd(
                Some(status::REQUESTED_FILE_ACTION_OK),
                &format!("RMD {path}"),
            )
            .await?;
        Ok(())
    }

    /// Issues NOOP, typically to keep an idle control stream alive.
    pub async fn noop(&mut self) -> Result<()> {
        self.control.cmd(Some(status::COMMAND_OK), "NOOP").await?;
        Ok(())
    }

    /// Issues REIN to drop the current login.
    pub async fn logout(&mut self) -> Result<()> {
        self.control.cmd(Some(status::READY), "REIN").await?;
        Ok(())
    }

    /// Sends a best-effort QUIT and closes the control stream.
    pub async fn quit(&mut self) -> Result<()> {
        let _ = self.control.send_command("QUIT").await;
        self.control.close().await
    }

    /// Runs a command expecting a data stream from the server: optional
    /// REST, the command itself, a 125/150 reply carrying the stream ID,
    /// then the rendezvous with the stream of that ID.
    async fn cmd_data_recv(&mut self, command: String, offset: u64) -> Result<RecvStream> {
        if offset > 0 {
            self.control
                .cmd(Some(status::REQUEST_FILE_PENDING), &format!("REST {offset}"))
                .await?;
        }

        self.control.send_command(&command).await?;
        let (code, message) = self.control.read_reply(None).await?;
        if code != status::ALREADY_OPEN && code != status::ABOUT_TO_SEND {
            return Err(Error::UnexpectedReply { code, message });
        }

        let id = parse_stream_id(&message)?;
        self.claim_recv_stream(id).await
    }

    /// Runs a command that uploads over a locally opened data stream.
    /// The stream ID goes into the command text right after the verb so
    /// the server knows which incoming stream carries the payload.
    async fn cmd_data_send(&mut self, command: &str, offset: u64) -> Result<SendStream> {
        let mut stream = self.open_data_send_stream().await?;
        let id = raw_id(stream.id());

        if offset > 0 {
            if let Err(err) = self
                .control
                .cmd(Some(status::REQUEST_FILE_PENDING), &format!("REST {offset}"))
                .await
            {
                let _ = stream.finish();
                return Err(err);
            }
        }

        if let Err(err) = self.control.send_command(&splice_stream_id(command, id)).await {
            let _ = stream.finish();
            return Err(err);
        }
        let (code, message) = match self.control.read_reply(None).await {
            Ok(reply) => reply,
            Err(err) => {
                let _ = stream.finish();
                return Err(err);
            }
        };
        if code != status::ALREADY_OPEN && code != status::ABOUT_TO_SEND {
            let _ = stream.finish();
            return Err(Error::UnexpectedReply { code, message });
        }

        debug!(id, command, "data send stream open");
        Ok(stream)
    }

    async fn open_data_send_stream(&mut self) -> Result<SendStream> {
        // Stream opens share the session lock with the pending-map
        // bookkeeping below.
        let _guard = self.pending.lock().await;
        Ok(self.connection.open_uni().await?)
    }

    /// Claims the server data stream with raw ID `id`. Streams that
    /// arrive for other sub-connections are filed in the pending map
    /// under their own IDs. The lock is released around every accept so
    /// concurrent claims can make progress; an accepted ID above `id`
    /// means `id` can no longer arrive.
    async fn claim_recv_stream(&mut self, id: u64) -> Result<RecvStream> {
        loop {
            {
                let mut pending = self.pending.lock().await;
                if let Some(stream) = pending.remove(&id) {
                    return Ok(stream);
                }
            }
            let stream = self.connection.accept_uni().await?;
            let accepted = raw_id(stream.id());
            trace!(want = id, accepted, "data stream accepted");
            let mut pending = self.pending.lock().await;
            pending.insert(accepted, stream);
            if accepted > id {
                // Streams are delivered in ID order, so a higher ID means
                // ours was already handed to a concurrent claimant; it is
                // either in the map by now or never existed.
                if let Some(stream) = pending.remove(&id) {
                    return Ok(stream);
                }
                return Err(Error::LostStream { id, seen: accepted });
            }
        }
    }

    /// Reads the closing reply of a finished transfer off the control
    /// stream. Data streams are unidirectional: the server closes them,
    /// we never do.
    pub(crate) async fn finalize_transfer(&mut self) -> Result<()> {
        self.control
            .read_reply(Some(status::CLOSING_DATA_CONNECTION))
            .await?;
        Ok(())
    }
}

/// Streaming body of a download. Read it to the end, then call
/// [`DataReader::finish`]; dropping it early leaves the closing reply
/// queued on the control stream.
pub struct DataReader<'a> {
    stream: RecvStream,
    sub: &'a mut SubConn,
}

impl DataReader<'_> {
    /// Consumes the closing reply from the control stream.
    pub async fn finish(self) -> Result<()> {
        self.sub.finalize_transfer().await
    }
}

impl AsyncRead for DataReader<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

/// Extracts and validates the leading `<id> ` of a transfer reply.
fn parse_stream_id(message: &str) -> Result<u64> {
    let Some((id, _)) = message.split_once(' ') else {
        return Err(Error::Protocol(
            "transfer reply does not carry a data stream id".into(),
        ));
    };
    let id: u64 = id
        .parse()
        .map_err(|_| Error::Protocol(format!("bad data stream id {id:?}")))?;
    if !is_server_uni(id) {
        return Err(Error::Protocol(format!(
            "stream {id} is not a server unidirectional stream"
        )));
    }
    Ok(id)
}

/// Inserts the data-stream ID between the verb and its arguments:
/// `STOR file` becomes `STOR 7 file`.
fn splice_stream_id(command: &str, id: u64) -> String {
    match command.split_once(' ') {
        Some((verb, rest)) => format!("{verb} {id} {rest}"),
        None => format!("{command} {id}"),
    }
}

/// Drains `stream` line by line, returning what was read and the first
/// error if one cut the listing short.
async fn read_lines(stream: RecvStream) -> (Vec<String>, Option<Error>) {
    let mut reader = BufReader::new(stream);
    let mut lines = Vec::new();
    let mut buf = String::new();
    loop {
        buf.clear();
        match reader.read_line(&mut buf).await {
            Ok(0) => return (lines, None),
            Ok(_) => {
                while buf.ends_with('\n') || buf.ends_with('\r') {
                    buf.pop();
                }
                lines.push(buf.clone());
            }
            Err(err) => return (lines, Some(err.into())),
        }
    }
}
