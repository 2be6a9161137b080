//! Parallel transfers over a pool of sub-connections.
//!
//! Tasks go into a shared queue followed by one sentinel per worker;
//! a worker exits when it pops a sentinel. One worker runs on the
//! caller's default sub-connection, the rest on freshly logged-in
//! sub-connections of the same session. Every per-task outcome lands
//! on a result channel that is drained after the caller's own loop
//! finishes.

use std::path::PathBuf;
use std::sync::Arc;

use quinn::Connection;
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::{open_sub, Credentials, PendingStreams, Session};
use crate::sub_conn::SubConn;

/// Which way a [`TransferTask`] moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Retrieve,
    Store,
}

/// One file transfer for [`Session::multiple_transfer`].
#[derive(Debug, Clone)]
pub struct TransferTask {
    direction: Direction,
    local_path: PathBuf,
    remote_path: String,
    finished: bool,
}

impl TransferTask {
    pub fn new(
        direction: Direction,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
    ) -> Self {
        Self {
            direction,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            finished: false,
        }
    }

    /// Queue terminator; consumed by exactly one worker.
    fn sentinel() -> Self {
        Self {
            direction: Direction::Store,
            local_path: PathBuf::new(),
            remote_path: String::new(),
            finished: true,
        }
    }
}

/// Marks results of workers that died during login or CWD, before
/// taking any work. The collector tallies these apart from task
/// failures.
const WORKER_RESET_PREFIX: &str = "Go routine reset.";

type TaskQueue = Arc<Mutex<mpsc::Receiver<TransferTask>>>;
type TaskOutcome = std::result::Result<(), String>;

pub(crate) async fn multiple_transfer(
    session: &mut Session,
    tasks: Vec<TransferTask>,
    nr_parallel: i32,
) -> Result<()> {
    let credentials = session
        .credentials
        .clone()
        .ok_or_else(|| Error::Config("multiple_transfer requires a prior login".into()))?;

    // Workers start out in the directory the facade currently sits in.
    let directory = session.main.current_dir().await?;

    if tasks.is_empty() {
        return Ok(());
    }

    // No more connections than tasks; negative means no limit, and the
    // caller's own sub-connection always counts as one worker.
    let workers = if nr_parallel < 0 || tasks.len() < nr_parallel as usize {
        tasks.len()
    } else {
        (nr_parallel as usize).max(1)
    };
    let total = tasks.len();

    let (task_tx, task_rx) = mpsc::channel(total + workers);
    let (result_tx, mut result_rx) = mpsc::channel::<TaskOutcome>(total + workers);

    // Queue every task, then a sentinel per worker.
    for mut task in tasks {
        task.finished = false;
        task_tx.send(task).await.expect("task queue open");
    }
    for _ in 0..workers {
        task_tx
            .send(TransferTask::sentinel())
            .await
            .expect("task queue open");
    }
    drop(task_tx);
    let queue: TaskQueue = Arc::new(Mutex::new(task_rx));

    for worker in 1..workers {
        let connection = session.connection.clone();
        let pending = session.pending.clone();
        let credentials = credentials.clone();
        let directory = directory.clone();
        let queue = queue.clone();
        let results = result_tx.clone();
        tokio::spawn(async move {
            run_worker(
                worker,
                connection,
                pending,
                credentials,
                directory,
                queue,
                results,
            )
            .await;
        });
    }

    // The default sub-connection works the queue too; it is already
    // logged in and sitting in the right directory.
    loop {
        let task = { queue.lock().await.recv().await };
        let Some(task) = task else { break };
        if task.finished {
            break;
        }
        let outcome = run_task(&mut session.main, &task).await;
        result_tx.send(outcome).await.expect("result queue open");
    }
    drop(result_tx);

    // Workers hang up after their sentinel (or their reset), so draining
    // the channel sees every result exactly once.
    let mut normal = 0usize;
    let mut reset = 0usize;
    let mut combined = String::new();
    while let Some(outcome) = result_rx.recv().await {
        match outcome {
            Ok(()) => normal += 1,
            Err(message) => {
                if message.starts_with(WORKER_RESET_PREFIX) {
                    reset += 1;
                } else {
                    normal += 1;
                }
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&message);
            }
        }
    }
    debug!(normal, reset, total, "parallel transfer drained");

    if combined.is_empty() {
        Ok(())
    } else {
        Err(Error::Aggregate(combined))
    }
}

/// One pooled worker: log in, change to the shared directory, then run
/// tasks until a sentinel arrives. Setup failure emits a single
/// reset-prefixed result.
async fn run_worker(
    worker: usize,
    connection: Connection,
    pending: PendingStreams,
    credentials: Credentials,
    directory: String,
    queue: TaskQueue,
    results: mpsc::Sender<TaskOutcome>,
) {
    let mut sub = match prepare_worker(&connection, &pending, &credentials, &directory).await {
        Ok(sub) => sub,
        Err(err) => {
            warn!(worker, %err, "worker reset");
            let _ = results
                .send(Err(format!("{WORKER_RESET_PREFIX} {err}")))
                .await;
            return;
        }
    };

    loop {
        let task = { queue.lock().await.recv().await };
        let Some(task) = task else { break };
        if task.finished {
            break;
        }
        let outcome = run_task(&mut sub, &task).await;
        if results.send(outcome).await.is_err() {
            break;
        }
    }
    let _ = sub.quit().await;
}

async fn prepare_worker(
    connection: &Connection,
    pending: &PendingStreams,
    credentials: &Credentials,
    directory: &str,
) -> Result<SubConn> {
    let mut sub = open_sub(connection, pending).await?;
    sub.login(&credentials.user, &credentials.password).await?;
    sub.change_dir(directory).await?;
    Ok(sub)
}

async fn run_task(sub: &mut SubConn, task: &TransferTask) -> TaskOutcome {
    match task.direction {
        Direction::Store => stor_task(sub, task).await,
        Direction::Retrieve => retr_task(sub, task).await,
    }
}

/// Uploads one local file.
async fn stor_task(sub: &mut SubConn, task: &TransferTask) -> TaskOutcome {
    let mut file = fs::File::open(&task.local_path).await.map_err(|err| {
        format!(
            "Error while opening the local file {}. {err}",
            task.local_path.display()
        )
    })?;
    sub.stor(&task.remote_path, &mut file).await.map_err(|err| {
        format!(
            "Error while writing file {} to server. {err}",
            task.local_path.display()
        )
    })
}

/// Downloads one remote file, refusing to overwrite local data.
async fn retr_task(sub: &mut SubConn, task: &TransferTask) -> TaskOutcome {
    if fs::try_exists(&task.local_path).await.unwrap_or(false) {
        return Err("File with this name already exists in local folder.".to_string());
    }

    let mut file = fs::File::create(&task.local_path)
        .await
        .map_err(|err| format!("Error while creating the local file. {err}"))?;

    let mut reader = sub
        .retr(&task.remote_path)
        .await
        .map_err(|err| err.to_string())?;
    if let Err(err) = tokio::io::copy(&mut reader, &mut file).await {
        let mut message = format!("Error while writing file to local file. {err}");
        if let Err(close_err) = reader.finish().await {
            message.push_str(&format!(
                " Error while closing reader from server. {close_err}"
            ));
        }
        return Err(message);
    }

    reader
        .finish()
        .await
        .map_err(|err| format!("Error while closing reader from server. {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_flagged_finished() {
        let task = TransferTask::new(Direction::Store, "a.txt", "b.txt");
        assert!(!task.finished);
        assert!(TransferTask::sentinel().finished);
    }
}
