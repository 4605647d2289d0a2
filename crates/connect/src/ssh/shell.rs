// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Primary interactive shell of the target hop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::handler::lock;
use crate::connector::{PtyRequest, ShellChannel};
use crate::error::TransportError;
use crate::signal::{DisconnectReason, DisconnectReporter};

const OUTPUT_BUFFER: usize = 1024;

enum ShellCommand {
    Data(Vec<u8>),
    Resize(u32, u32),
    Close,
}

pub(crate) struct RusshShell {
    commands: mpsc::Sender<ShellCommand>,
    output: broadcast::Sender<Vec<u8>>,
    /// Subscribed before the shell started, so it holds everything said so far
    first_receiver: Mutex<Option<broadcast::Receiver<Vec<u8>>>>,
    closing: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RusshShell {
    /// Request a PTY and a shell on `channel`, then pump it from a task
    pub(crate) async fn start(
        channel: Channel<Msg>,
        pty: &PtyRequest,
        reporter: DisconnectReporter,
    ) -> Result<Self, TransportError> {
        channel
            .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
            .await
            .map_err(|e| TransportError::Channel(format!("PTY request failed: {}", e)))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| TransportError::Channel(format!("Shell request failed: {}", e)))?;
        debug!("Shell started ({} {}x{})", pty.term, pty.cols, pty.rows);

        let (commands, command_rx) = mpsc::channel(OUTPUT_BUFFER);
        let (output, first_receiver) = broadcast::channel(OUTPUT_BUFFER);
        let closing = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(pump(
            channel,
            command_rx,
            output.clone(),
            closing.clone(),
            reporter,
        ));

        Ok(Self {
            commands,
            output,
            first_receiver: Mutex::new(Some(first_receiver)),
            closing,
            task: Mutex::new(Some(task)),
        })
    }

    async fn send(&self, command: ShellCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::Channel("shell is closed".to_string()))
    }
}

async fn pump(
    mut channel: Channel<Msg>,
    mut commands: mpsc::Receiver<ShellCommand>,
    output: broadcast::Sender<Vec<u8>>,
    closing: Arc<AtomicBool>,
    reporter: DisconnectReporter,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ShellCommand::Data(data)) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        warn!("Failed to write to shell: {}", e);
                        break;
                    }
                }
                Some(ShellCommand::Resize(cols, rows)) => {
                    if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                        warn!("Failed to resize PTY to {}x{}: {}", cols, rows, e);
                    }
                }
                Some(ShellCommand::Close) => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
                // Shell handle dropped without close
                None => {
                    closing.store(true, Ordering::SeqCst);
                    let _ = channel.close().await;
                    break;
                }
            },
            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) => {
                    let _ = output.send(data.to_vec());
                }
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                    let _ = output.send(data.to_vec());
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    info!("Remote shell exited with status {}", exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    if !closing.load(Ordering::SeqCst) {
        reporter.report(DisconnectReason::StreamClosed);
    }
    debug!("Shell pump finished");
}

#[async_trait]
impl ShellChannel for RusshShell {
    async fn resize(&self, cols: u32, rows: u32) -> Result<(), TransportError> {
        self.send(ShellCommand::Resize(cols, rows)).await
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.send(ShellCommand::Data(data.to_vec())).await
    }

    fn subscribe_output(&self) -> broadcast::Receiver<Vec<u8>> {
        lock(&self.first_receiver)
            .take()
            .unwrap_or_else(|| self.output.subscribe())
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        // The pump may already be gone if the stream ended on its own
        let _ = self.commands.send(ShellCommand::Close).await;
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Shell task ended abnormally: {}", e);
            }
        }
    }
}
