//! End-to-end tests against an in-process FTP-over-QUIC server.
//!
//! The fixture implements just enough of the server side: a control
//! handler per accepted bidirectional stream, data payloads on
//! unidirectional streams with the stream ID prefixed to the 150 reply,
//! and the mirrored rendezvous for uploads.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Connection, RecvStream, SendStream};
use rustls_pki_types::PrivatePkcs8KeyDer;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::Mutex;

use qftp::transport::raw_id;
use qftp::{Direction, Error, Session, TransferTask};

const TEST_DATA: &str = "Just some text";

// ---------------------------------------------------------------------
// server fixture
// ---------------------------------------------------------------------

struct Fixture {
    addr: String,
    cert: tempfile::NamedTempFile,
    root: tempfile::TempDir,
    server: tokio::task::JoinHandle<()>,
}

impl Fixture {
    fn cert_path(&self) -> &Path {
        self.cert.path()
    }

    fn root(&self) -> &Path {
        self.root.path()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn start_server() -> Result<Fixture> {
    let root = tempfile::tempdir()?;

    let signed =
        rcgen::generate_simple_self_signed(vec!["localhost".into(), "127.0.0.1".into()])?;
    let cert_der = signed.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(signed.signing_key.serialize_der());
    let mut cert = tempfile::NamedTempFile::new()?;
    cert.write_all(signed.cert.pem().as_bytes())?;
    cert.flush()?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut crypto = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key.into())?;
    crypto.alpn_protocols = vec![qftp::transport::ALPN.to_vec()];

    let config = quinn::ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(crypto)?));
    let endpoint = quinn::Endpoint::server(config, "127.0.0.1:0".parse()?)?;
    let addr = format!("127.0.0.1:{}", endpoint.local_addr()?.port());

    let serve_root = root.path().to_path_buf();
    let server = tokio::spawn(async move {
        while let Some(incoming) = endpoint.accept().await {
            let root = serve_root.clone();
            tokio::spawn(async move {
                let Ok(connection) = incoming.await else {
                    return;
                };
                // Uploads accepted for other control handlers get parked
                // here, keyed by raw stream ID.
                let parked: Parked = Arc::new(Mutex::new(HashMap::new()));
                loop {
                    match connection.accept_bi().await {
                        Ok((send, recv)) => {
                            let connection = connection.clone();
                            let parked = parked.clone();
                            let root = root.clone();
                            tokio::spawn(async move {
                                let _ =
                                    handle_control(connection, parked, root, send, recv).await;
                            });
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    });

    Ok(Fixture {
        addr,
        cert,
        root,
        server,
    })
}

type Parked = Arc<Mutex<HashMap<u64, RecvStream>>>;

struct ControlState {
    cwd: Vec<String>,
    user: Option<String>,
    logged_in: bool,
    rename_from: Option<PathBuf>,
    rest_offset: u64,
}

async fn handle_control(
    connection: Connection,
    parked: Parked,
    root: PathBuf,
    mut send: SendStream,
    recv: RecvStream,
) -> Result<()> {
    let mut reader = BufReader::new(recv);
    let mut state = ControlState {
        cwd: Vec::new(),
        user: None,
        logged_in: false,
        rename_from: None,
        rest_offset: 0,
    };

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let (verb, arg) = trimmed.split_once(' ').unwrap_or((trimmed, ""));

        let verb = verb.to_ascii_uppercase();
        if matches!(verb.as_str(), "NLST" | "LIST" | "RETR" | "STOR") && !state.logged_in {
            reply(&mut send, "530 Please login with USER and PASS.").await?;
            continue;
        }

        match verb.as_str() {
            "FEAT" => {
                reply(&mut send, "211-Features:\r\n MLST\r\n REST STREAM\r\n211 End")
                    .await?;
            }
            "USER" => {
                if arg == "anonymous" {
                    state.user = Some(arg.to_string());
                    reply(&mut send, "331 User name okay, need password.").await?;
                } else {
                    reply(&mut send, "530 Not logged in.").await?;
                }
            }
            "PASS" => {
                if state.user.is_some() && arg == "anonymous" {
                    state.logged_in = true;
                    reply(&mut send, "230 User logged in, proceed.").await?;
                } else {
                    reply(&mut send, "530 Not logged in.").await?;
                }
            }
            "TYPE" => reply(&mut send, "200 Type set.").await?,
            "NOOP" => reply(&mut send, "200 Okay.").await?,
            "PWD" => {
                let path = virtual_path(&state.cwd);
                reply(&mut send, &format!("257 \"{path}\" is the current directory."))
                    .await?;
            }
            "CWD" => {
                let target = components_of(&state.cwd, arg);
                if fs_path(&root, &target).is_dir() {
                    state.cwd = target;
                    reply(&mut send, "250 Directory changed.").await?;
                } else {
                    reply(&mut send, "550 Failed to change directory.").await?;
                }
            }
            "CDUP" => {
                state.cwd.pop();
                reply(&mut send, "250 Directory changed.").await?;
            }
            "MKD" => {
                let target = components_of(&state.cwd, arg);
                tokio::fs::create_dir(fs_path(&root, &target)).await?;
                reply(&mut send, &format!("257 \"{arg}\" created.")).await?;
            }
            "RMD" => {
                let target = components_of(&state.cwd, arg);
                if tokio::fs::remove_dir(fs_path(&root, &target)).await.is_ok() {
                    reply(&mut send, "250 Directory removed.").await?;
                } else {
                    reply(&mut send, "550 Remove failed.").await?;
                }
            }
            "DELE" => {
                let target = components_of(&state.cwd, arg);
                if tokio::fs::remove_file(fs_path(&root, &target)).await.is_ok() {
                    reply(&mut send, "250 File deleted.").await?;
                } else {
                    reply(&mut send, "550 Delete failed.").await?;
                }
            }
            "RNFR" => {
                let target = fs_path(&root, &components_of(&state.cwd, arg));
                if target.exists() {
                    state.rename_from = Some(target);
                    reply(&mut send, "350 Ready for destination name.").await?;
                } else {
                    reply(&mut send, "550 No such file.").await?;
                }
            }
            "RNTO" => match state.rename_from.take() {
                Some(from) => {
                    let to = fs_path(&root, &components_of(&state.cwd, arg));
                    tokio::fs::rename(from, to).await?;
                    reply(&mut send, "250 Renamed.").await?;
                }
                None => reply(&mut send, "503 RNFR first.").await?,
            },
            "REST" => {
                state.rest_offset = arg.parse().unwrap_or(0);
                reply(&mut send, "350 Restarting at offset.").await?;
            }
            "NLST" => {
                let names = dir_names(&root, &state.cwd, arg).await?;
                let mut payload = names.join("\r\n");
                if !payload.is_empty() {
                    payload.push_str("\r\n");
                }
                send_data(&connection, &mut send, payload.as_bytes()).await?;
            }
            "LIST" => {
                let names = dir_names(&root, &state.cwd, arg).await?;
                let mut payload = String::new();
                for name in names {
                    let path = fs_path(&root, &components_of(&state.cwd, &name));
                    let (kind, size) = if path.is_dir() {
                        ("dir", 0)
                    } else {
                        ("file", path.metadata().map(|m| m.len()).unwrap_or(0))
                    };
                    payload.push_str(&format!(
                        "modify=20200101000000;size={size};type={kind}; {name}\r\n"
                    ));
                }
                send_data(&connection, &mut send, payload.as_bytes()).await?;
            }
            "RETR" => {
                let target = fs_path(&root, &components_of(&state.cwd, arg));
                match tokio::fs::read(&target).await {
                    Ok(bytes) => {
                        let offset = (state.rest_offset.min(bytes.len() as u64)) as usize;
                        state.rest_offset = 0;
                        send_data(&connection, &mut send, &bytes[offset..]).await?;
                    }
                    Err(_) => reply(&mut send, "550 File not found.").await?,
                }
            }
            "STOR" => {
                let Some((id, path)) = arg.split_once(' ') else {
                    reply(&mut send, "501 Missing stream id.").await?;
                    continue;
                };
                let id: u64 = id.parse().context("stream id")?;
                let target = fs_path(&root, &components_of(&state.cwd, path));
                reply(&mut send, &format!("150 {id} Ok to receive data.")).await?;
                let mut stream = claim_upload(&connection, &parked, id).await?;
                let body = stream.read_to_end(64 * 1024 * 1024).await?;
                let offset = state.rest_offset;
                state.rest_offset = 0;
                write_at(&target, offset, &body).await?;
                reply(&mut send, "226 Transfer complete.").await?;
            }
            "REIN" => {
                state.user = None;
                state.logged_in = false;
                reply(&mut send, "220 Service ready for new user.").await?;
            }
            "QUIT" => {
                reply(&mut send, "221 Goodbye.").await?;
                return Ok(());
            }
            _ => reply(&mut send, "502 Command not implemented.").await?,
        }
    }
}

async fn reply(send: &mut SendStream, text: &str) -> Result<()> {
    send.write_all(format!("{text}\r\n").as_bytes()).await?;
    Ok(())
}

/// Opens the data stream, announces its ID in the preliminary reply,
/// ships the payload and completes the transfer on the control stream.
async fn send_data(connection: &Connection, control: &mut SendStream, payload: &[u8]) -> Result<()> {
    let mut data = connection.open_uni().await?;
    let id = raw_id(data.id());
    reply(control, &format!("150 {id} Opening data stream.")).await?;
    data.write_all(payload).await?;
    data.finish()?;
    reply(control, "226 Transfer complete.").await?;
    Ok(())
}

/// Server-side mirror of the client's rendezvous: take the announced
/// upload stream from the shared map, accepting and parking streams
/// that belong to other control handlers.
async fn claim_upload(connection: &Connection, parked: &Parked, id: u64) -> Result<RecvStream> {
    loop {
        if let Some(stream) = parked.lock().await.remove(&id) {
            return Ok(stream);
        }
        let stream = connection.accept_uni().await?;
        let accepted = raw_id(stream.id());
        let mut parked = parked.lock().await;
        parked.insert(accepted, stream);
        if accepted > id {
            if let Some(stream) = parked.remove(&id) {
                return Ok(stream);
            }
            anyhow::bail!("upload stream {id} lost");
        }
    }
}

async fn write_at(target: &Path, offset: u64, body: &[u8]) -> Result<()> {
    if offset == 0 {
        tokio::fs::write(target, body).await?;
        return Ok(());
    }
    use std::io::{Seek, SeekFrom, Write};
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(target)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(body)?;
    Ok(())
}

fn components_of(cwd: &[String], arg: &str) -> Vec<String> {
    let mut out: Vec<String> = if arg.starts_with('/') {
        Vec::new()
    } else {
        cwd.to_vec()
    };
    for part in arg.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            name => out.push(name.to_string()),
        }
    }
    out
}

fn fs_path(root: &Path, components: &[String]) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in components {
        path.push(part);
    }
    path
}

fn virtual_path(cwd: &[String]) -> String {
    format!("/{}", cwd.join("/"))
}

async fn dir_names(root: &Path, cwd: &[String], arg: &str) -> Result<Vec<String>> {
    let dir = fs_path(root, &components_of(cwd, arg));
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

// ---------------------------------------------------------------------
// tests
// ---------------------------------------------------------------------

async fn dial(fixture: &Fixture) -> Result<Session> {
    Ok(Session::dial(
        &fixture.addr,
        fixture.cert_path(),
        Some(Duration::from_secs(5)),
    )
    .await?)
}

async fn read_all(reader: &mut qftp::DataReader<'_>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_session_round_trip() -> Result<()> {
    let fixture = start_server().await?;
    std::fs::create_dir(fixture.root().join("incoming"))?;

    let mut c = dial(&fixture).await?;
    assert!(
        c.features().contains_key("MLST"),
        "initial FEAT should fill the feature map: {:?}",
        c.features()
    );

    c.login("anonymous", "anonymous").await?;
    c.noop().await?;
    c.change_dir("incoming").await?;

    c.stor("test", &mut TEST_DATA.as_bytes()).await?;

    let entries = c.list(".").await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "test");
    assert_eq!(entries[0].size, TEST_DATA.len() as u64);

    c.rename("test", "tset").await?;

    let mut r = c.retr("tset").await?;
    let body = read_all(&mut r).await?;
    r.finish().await?;
    assert_eq!(body, TEST_DATA.as_bytes());

    let mut r = c.retr_from("tset", 5).await?;
    let body = read_all(&mut r).await?;
    r.finish().await?;
    assert_eq!(body, TEST_DATA.as_bytes()[5..].to_vec());

    c.delete("tset").await?;

    c.make_dir("mydir").await?;
    c.change_dir("mydir").await?;
    assert_eq!(c.current_dir().await?, "/incoming/mydir");
    c.change_dir_to_parent().await?;

    assert_eq!(c.name_list("/").await?, vec!["incoming".to_string()]);

    c.remove_dir("mydir").await?;

    // drop the login, then come back
    c.logout().await?;
    c.login("anonymous", "anonymous").await?;

    c.quit().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_login_is_rejected() -> Result<()> {
    let fixture = start_server().await?;
    let mut c = dial(&fixture).await?;
    match c.login("zoo2Shia", "fei5Yix9").await {
        Err(Error::UnexpectedReply { code, .. }) => assert_eq!(code, 530),
        other => panic!("expected reply error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_feat_is_stable() -> Result<()> {
    let fixture = start_server().await?;
    let mut c = dial(&fixture).await?;
    let first = c.features().clone();
    c.feat().await?;
    assert_eq!(&first, c.features());
    c.quit().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dial_times_out_without_a_server() -> Result<()> {
    let fixture = start_server().await?;
    let result = Session::dial(
        "127.0.0.1:9",
        fixture.cert_path(),
        Some(Duration::from_secs(1)),
    )
    .await;
    match result {
        Err(Error::HandshakeTimeout) | Err(Error::Connection(_)) => {}
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("dial unexpectedly succeeded"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_retrieves_share_the_stream_map() -> Result<()> {
    let fixture = start_server().await?;
    let payload_a = vec![0xaau8; 256 * 1024];
    let payload_b = vec![0xbbu8; 256 * 1024];
    std::fs::write(fixture.root().join("a.bin"), &payload_a)?;
    std::fs::write(fixture.root().join("b.bin"), &payload_b)?;

    let mut c = dial(&fixture).await?;
    c.login("anonymous", "anonymous").await?;
    let mut sub = c.new_sub().await?;
    sub.login("anonymous", "anonymous").await?;

    // Two downloads race on different sub-connections; the pending map
    // has to route each stream to its rightful claimant.
    let (a, b) = tokio::join!(
        async {
            let mut r = c.retr("a.bin").await?;
            let body = read_all(&mut r).await?;
            r.finish().await?;
            Ok::<_, anyhow::Error>(body)
        },
        async {
            let mut r = sub.retr("b.bin").await?;
            let body = read_all(&mut r).await?;
            r.finish().await?;
            Ok::<_, anyhow::Error>(body)
        }
    );
    assert_eq!(a?, payload_a);
    assert_eq!(b?, payload_b);

    sub.quit().await?;
    c.quit().await?;
    Ok(())
}

const LOCAL_FILE_NUMBERS: [u32; 9] = [1, 2, 5, 9, 11, 12, 14, 15, 17];
const REMOTE_FILE_NUMBERS: [u32; 9] = [3, 4, 6, 7, 8, 10, 13, 16, 18];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multiple_transfer_moves_files_both_ways() -> Result<()> {
    let fixture = start_server().await?;
    let local = tempfile::tempdir()?;

    let mut c = dial(&fixture).await?;
    c.login("anonymous", "anonymous").await?;
    c.make_dir("exchange").await?;
    c.change_dir("exchange").await?;

    // Seed: nine files locally, nine files remotely.
    for number in LOCAL_FILE_NUMBERS {
        std::fs::write(
            local.path().join(format!("{number}.txt")),
            format!("{TEST_DATA} {number}"),
        )?;
    }
    for number in REMOTE_FILE_NUMBERS {
        let body = format!("{TEST_DATA} {number}");
        c.stor(&format!("{number}.txt"), &mut body.as_bytes()).await?;
    }

    let mut tasks = Vec::new();
    for number in LOCAL_FILE_NUMBERS {
        tasks.push(TransferTask::new(
            Direction::Store,
            local.path().join(format!("{number}.txt")),
            format!("{number}.txt"),
        ));
    }
    for number in REMOTE_FILE_NUMBERS {
        tasks.push(TransferTask::new(
            Direction::Retrieve,
            local.path().join(format!("{number}.txt")),
            format!("{number}.txt"),
        ));
    }

    c.multiple_transfer(tasks, 4).await?;

    // Remote side now holds all eighteen files.
    let remote_names = c.name_list(".").await?;
    assert_eq!(remote_names.len(), 18, "remote: {remote_names:?}");
    for number in LOCAL_FILE_NUMBERS.iter().chain(&REMOTE_FILE_NUMBERS) {
        assert!(remote_names.contains(&format!("{number}.txt")));
    }

    // Every retrieve landed locally with the right content.
    for number in REMOTE_FILE_NUMBERS {
        let body = std::fs::read_to_string(local.path().join(format!("{number}.txt")))?;
        assert_eq!(body, format!("{TEST_DATA} {number}"));
    }

    c.quit().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multiple_transfer_refuses_to_overwrite_local_files() -> Result<()> {
    let fixture = start_server().await?;
    let local = tempfile::tempdir()?;

    let mut c = dial(&fixture).await?;
    c.login("anonymous", "anonymous").await?;

    c.stor("remote.txt", &mut TEST_DATA.as_bytes()).await?;
    let clash = local.path().join("remote.txt");
    std::fs::write(&clash, "already here")?;

    let tasks = vec![TransferTask::new(
        Direction::Retrieve,
        &clash,
        "remote.txt",
    )];
    match c.multiple_transfer(tasks, 1).await {
        Err(Error::Aggregate(message)) => {
            assert!(message.contains("already exists"), "message: {message}");
        }
        other => panic!("expected aggregate error, got {other:?}"),
    }
    assert_eq!(std::fs::read_to_string(&clash)?, "already here");

    c.quit().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stor_from_appends_at_the_given_offset() -> Result<()> {
    let fixture = start_server().await?;
    let mut c = dial(&fixture).await?;
    c.login("anonymous", "anonymous").await?;

    c.stor("f", &mut TEST_DATA.as_bytes()).await?;
    c.stor_from("f", &mut "SOME".as_bytes(), 5).await?;

    let mut r = c.retr("f").await?;
    let body = read_all(&mut r).await?;
    r.finish().await?;
    assert_eq!(body, b"Just SOME text");

    c.quit().await?;
    Ok(())
}
