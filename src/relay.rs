//! Bridges one WebSocket connection to one shell process.
//!
//! Output flows process -> socket on a dedicated task. Input is queued to a
//! second task and applied in arrival order: a JSON `resize` envelope with
//! positive dimensions adjusts the terminal geometry, anything else is written
//! to the shell verbatim. The connection task keeps reading the socket while a
//! write is pending, so a disconnect is noticed even when the shell has stopped
//! reading its input.

use std::borrow::Cow;
use std::fmt::Display;
use std::io;
use std::path::Path;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::pty::{ConnectionId, PtyProcess, PtyReader, PtyWriter};

/// Size of each read from the terminal; every non-empty read becomes one frame.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Close reason sent when the shell cannot be started.
pub const SPAWN_FAILURE_REASON: &str = "Failed to start terminal";

/// Client messages queued ahead of a shell that is slow to read its input.
const INPUT_QUEUE_DEPTH: usize = 64;

const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ControlEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    cols: i64,
    #[serde(default)]
    rows: i64,
}

/// How an inbound payload is interpreted.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// A resize envelope with positive dimensions.
    Resize { cols: i64, rows: i64 },
    /// Raw terminal input.
    Input(&'a [u8]),
}

impl<'a> Inbound<'a> {
    pub fn classify(payload: &'a [u8]) -> Self {
        match serde_json::from_slice::<ControlEnvelope>(payload) {
            Ok(env) if env.kind == "resize" && env.cols > 0 && env.rows > 0 => {
                Inbound::Resize {
                    cols: env.cols,
                    rows: env.rows,
                }
            }
            _ => Inbound::Input(payload),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Active,
    Closing,
    Closed,
}

/// Per-connection record owning the shell process.
pub struct ConnectionRelay {
    conn: ConnectionId,
    process: PtyProcess,
    state: RelayState,
}

impl ConnectionRelay {
    pub fn new(process: PtyProcess) -> Self {
        Self {
            conn: process.connection(),
            process,
            state: RelayState::Active,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn process(&self) -> &PtyProcess {
        &self.process
    }

    pub fn close(&mut self) {
        if self.state == RelayState::Closed {
            return;
        }
        self.state = RelayState::Closing;
        self.process.close();
        self.state = RelayState::Closed;
        info!(conn = %self.conn, "Connection closed");
    }
}

/// Apply one client message. Errors are write failures on the shell input.
pub async fn handle_inbound(writer: &mut PtyWriter, payload: &[u8]) -> io::Result<()> {
    match Inbound::classify(payload) {
        Inbound::Resize { cols, rows } => {
            if let Err(e) = writer.resize(cols, rows) {
                warn!(conn = %writer.connection(), error = %e, "Resize failed");
            }
            Ok(())
        }
        Inbound::Input(data) => writer.write_all(data).await,
    }
}

/// Run a terminal session over an upgraded socket.
pub async fn serve(socket: WebSocket, shell: &Path, conn: ConnectionId) {
    let (outbound, inbound) = socket.split();
    run(inbound, outbound, shell, conn).await;
}

/// Spawn `shell` and relay between it and the given message halves until the
/// inbound side ends. The input and output tasks are stopped before this returns.
pub async fn run<S, K, E>(mut inbound: S, mut outbound: K, shell: &Path, conn: ConnectionId)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: Display,
{
    let process = match PtyProcess::spawn(shell, conn) {
        Ok(process) => process,
        Err(e) => {
            error!(%conn, error = %e, "Failed to start terminal");
            let frame = CloseFrame {
                code: close_code::ERROR,
                reason: Cow::Borrowed(SPAWN_FAILURE_REASON),
            };
            if let Err(e) = outbound.send(Message::Close(Some(frame))).await {
                debug!(%conn, error = %e, "Could not send close frame");
            }
            return;
        }
    };
    let (reader, writer) = match process.reader().and_then(|r| Ok((r, process.writer()?))) {
        Ok(halves) => halves,
        Err(e) => {
            error!(%conn, error = %e, "Terminal closed before relay started");
            return;
        }
    };

    let mut relay = ConnectionRelay::new(process);
    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
    let input = tokio::spawn(pump_input(writer, input_rx, conn));
    let output = tokio::spawn(pump_output(reader, outbound, conn));

    loop {
        let msg = tokio::select! {
            msg = inbound.next() => msg,
            // The input task stops after a failed write.
            _ = input_tx.closed() => break,
        };
        let payload = match msg {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(%conn, error = %e, "Connection error");
                break;
            }
        };
        if input_tx.send(payload).await.is_err() {
            break;
        }
    }

    relay.close();
    drop(input_tx);
    join_or_abort(input, conn, "input").await;
    join_or_abort(output, conn, "output").await;
}

async fn join_or_abort(mut task: JoinHandle<()>, conn: ConnectionId, name: &str) {
    if timeout(TASK_SHUTDOWN_GRACE, &mut task).await.is_err() {
        warn!(%conn, task = name, "Relay task did not stop, aborting");
        task.abort();
    }
}

async fn pump_input(
    mut writer: PtyWriter,
    mut input: mpsc::Receiver<Vec<u8>>,
    conn: ConnectionId,
) {
    while let Some(payload) = input.recv().await {
        if let Err(e) = handle_inbound(&mut writer, &payload).await {
            warn!(%conn, error = %e, "Failed to write to terminal");
            break;
        }
    }
}

async fn pump_output<K>(mut reader: PtyReader, mut outbound: K, conn: ConnectionId)
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!(%conn, "Shell exited");
                break;
            }
            Ok(n) => {
                if let Err(e) = outbound.send(Message::Binary(buf[..n].to_vec())).await {
                    warn!(%conn, error = %e, "Failed to forward terminal output");
                    break;
                }
            }
            Err(e) => {
                debug!(%conn, error = %e, "Stopped reading terminal output");
                break;
            }
        }
    }
}
