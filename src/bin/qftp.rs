//! Interactive FTP-over-QUIC client shell.
//!
//! Connects with a pinned server certificate and maps upper-cased
//! command words onto the client facade. `HELP` lists what is
//! available; `QUIT` leaves.

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use qftp::{EntryKind, Session};

#[derive(Parser, Debug)]
#[command(name = "qftp", about = "FTP client over QUIC")]
struct Args {
    /// Server hostname
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server control port
    #[arg(long, default_value_t = 2121)]
    port: u16,

    /// Path to the server certificate (PEM)
    #[arg(long)]
    cert: PathBuf,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);
    let mut session = Session::dial(
        &addr,
        &args.cert,
        Some(Duration::from_secs(args.timeout)),
    )
    .await
    .with_context(|| format!("connecting to {addr}"))?;
    println!("Connected to {addr}. Type HELP for available commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((command, parameters)) = words.split_first() else {
            continue;
        };
        let command = command.to_ascii_uppercase();
        if command == "QUIT" {
            break;
        }
        if let Err(err) = run_command(&mut session, &command, parameters).await {
            println!("{err:#}");
        }
    }

    session.quit().await?;
    Ok(())
}

async fn run_command(session: &mut Session, command: &str, parameters: &[&str]) -> Result<()> {
    match command {
        "HELP" => {
            println!("  Available commands:");
            println!("  HELP");
            println!("  LOGIN <user> <password>");
            println!("  FEAT");
            println!("  LIST [path]");
            println!("  NLST [path]");
            println!("  CWD <path>");
            println!("  CDUP");
            println!("  CLD <path>          change the local directory");
            println!("  PWD");
            println!("  RETR <local> <remote>");
            println!("  STOR <local> <remote>");
            println!("  RENAME <from> <to>");
            println!("  DELE <path>");
            println!("  MKD <path>");
            println!("  RMD <path>");
            println!("  NOOP");
            println!("  LOGOUT");
            println!("  QUIT");
        }
        "LOGIN" => {
            let [user, password] = parameters else {
                bail!("Please use LOGIN as \"LOGIN <user> <password>\".");
            };
            session.login(user, password).await?;
        }
        "FEAT" => {
            expect_no_parameters(command, parameters)?;
            for (feature, description) in session.features() {
                if description.is_empty() {
                    println!("  {feature}");
                } else {
                    println!("  {feature} {description}");
                }
            }
        }
        "LIST" => {
            let path = single_optional_path(command, parameters)?;
            for entry in session.list(path).await? {
                let kind = match entry.kind {
                    EntryKind::File => "-",
                    EntryKind::Folder => "d",
                    EntryKind::Link => "l",
                };
                let time = entry
                    .time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("  {kind} {:12} {:25} {}", entry.size, time, entry.name);
            }
        }
        "NLST" => {
            let path = single_optional_path(command, parameters)?;
            for name in session.name_list(path).await? {
                println!("  {name}");
            }
        }
        "CWD" => {
            let [path] = parameters else {
                bail!("CWD needs one parameter.");
            };
            session.change_dir(path).await?;
        }
        "CDUP" => {
            expect_no_parameters(command, parameters)?;
            session.change_dir_to_parent().await?;
        }
        "CLD" => {
            let [path] = parameters else {
                bail!("CLD needs one parameter.");
            };
            std::env::set_current_dir(path)?;
        }
        "PWD" => {
            expect_no_parameters(command, parameters)?;
            println!("  {}", session.current_dir().await?);
        }
        "RETR" => {
            let [local, remote] = parameters else {
                bail!("RETR needs two parameters.");
            };
            if tokio::fs::try_exists(local).await.unwrap_or(false) {
                bail!("File with this name already exists in local folder.");
            }
            let mut file = tokio::fs::File::create(local)
                .await
                .context("Error while creating the local file.")?;
            let mut reader = session.retr(remote).await?;
            tokio::io::copy(&mut reader, &mut file)
                .await
                .context("Error while writing file to local file.")?;
            reader.finish().await?;
        }
        "STOR" => {
            let [local, remote] = parameters else {
                bail!("STOR needs two parameters.");
            };
            let mut file = tokio::fs::File::open(local)
                .await
                .context("Error while opening the local file.")?;
            session
                .stor(remote, &mut file)
                .await
                .context("Error while writing file to server.")?;
        }
        "RENAME" => {
            let [from, to] = parameters else {
                bail!("RENAME needs two parameters.");
            };
            session.rename(from, to).await?;
        }
        "DELE" => {
            let [path] = parameters else {
                bail!("DELE needs one parameter.");
            };
            session.delete(path).await?;
        }
        "MKD" => {
            let [path] = parameters else {
                bail!("MKD needs one parameter.");
            };
            session.make_dir(path).await?;
        }
        "RMD" => {
            let [path] = parameters else {
                bail!("RMD needs one parameter.");
            };
            session.remove_dir(path).await?;
        }
        "NOOP" => {
            expect_no_parameters(command, parameters)?;
            session.noop().await?;
        }
        "LOGOUT" => {
            expect_no_parameters(command, parameters)?;
            session.logout().await?;
        }
        _ => {
            println!("Command not available at this client.");
        }
    }
    Ok(())
}

fn expect_no_parameters(command: &str, parameters: &[&str]) -> Result<()> {
    if !parameters.is_empty() {
        bail!("{command} accepts no parameter.");
    }
    Ok(())
}

fn single_optional_path<'a>(command: &str, parameters: &'a [&str]) -> Result<&'a str> {
    match parameters {
        [] => Ok("."),
        [path] => Ok(path),
        _ => bail!("{command} needs one or no parameter."),
    }
}
