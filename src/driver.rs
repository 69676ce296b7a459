//! Driver spawns and manages the protocol tasks
//!
//! Three tasks run per connection:
//!
//! - the **reader** owns the [`FrameSource`] and forwards complete frames,
//!   so a frame is never abandoned halfway through;
//! - the **pipeline** owns the [`AssayMachine`], classifies frames, answers
//!   intent requests and publishes snapshots and events;
//! - the **writer** owns the write half of the socket and drains the single
//!   command queue, so two frames never interleave on the wire.

use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assay::AssayCatalogue;
use crate::command::Command;
use crate::config::ConnectionConfig;
use crate::frame::{Frame, write_frame};
use crate::machine::{AssayMachine, EngineEvent, Intent, Output};
use crate::packet;
use crate::session::SessionState;
use crate::source::FrameSource;
use crate::{ProtocolError, Result};

/// Capacity of the event broadcast; slow subscribers lag rather than block.
pub const EVENT_CAPACITY: usize = 256;

const FRAME_QUEUE: usize = 64;
const INTENT_QUEUE: usize = 32;

/// Intent with the channel its verdict is sent back on.
#[derive(Debug)]
pub struct IntentRequest {
    pub intent: Intent,
    pub reply: oneshot::Sender<Result<()>>,
}

/// Result of spawning driver tasks
pub struct DriverChannels {
    /// Latest session snapshot
    pub sessions: watch::Receiver<Arc<SessionState>>,
    /// Latest catalogue snapshot
    pub catalogue: watch::Receiver<Arc<AssayCatalogue>>,
    /// Event sender, kept for subscribing
    pub events: broadcast::Sender<EngineEvent>,
    /// Intent requests for the pipeline
    pub intents: mpsc::Sender<IntentRequest>,
    /// Cancellation token for graceful shutdown
    pub cancel: CancellationToken,
}

/// Driver spawns and manages protocol tasks
pub struct Driver;

impl Driver {
    /// Spawn the reader, pipeline and writer tasks.
    ///
    /// The startup commands from `config` are queued before anything else.
    pub fn spawn<S, W>(source: S, writer: W, config: &ConnectionConfig) -> DriverChannels
    where
        S: FrameSource,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let machine = AssayMachine::new(config.repeats, config.correlation);

        let (session_tx, session_rx) = watch::channel(Arc::new(machine.session().clone()));
        let (catalogue_tx, catalogue_rx) = watch::channel(Arc::new(machine.catalogue().clone()));
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (intent_tx, intent_rx) = mpsc::channel(INTENT_QUEUE);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let cancel = CancellationToken::new();

        for command in config.startup.commands(now()) {
            // The receiver is alive until the writer task starts
            let _ = command_tx.send(command);
        }

        tokio::spawn(Self::reader_task(source, frame_tx, cancel.clone()));
        let writer = tokio::spawn(Self::writer_task(writer, command_rx, cancel.clone()));

        let pipeline = Pipeline {
            machine,
            commands: command_tx,
            session_tx,
            catalogue_tx,
            event_tx: event_tx.clone(),
        };
        tokio::spawn(pipeline.run(frame_rx, intent_rx, writer, cancel.clone()));

        DriverChannels {
            sessions: session_rx,
            catalogue: catalogue_rx,
            events: event_tx,
            intents: intent_tx,
            cancel,
        }
    }

    /// Frame reader task - forwards frames until the stream breaks
    async fn reader_task<S: FrameSource>(
        mut source: S,
        frames: mpsc::Sender<Result<Frame>>,
        cancel: CancellationToken,
    ) {
        debug!("Frame reader task started");
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = source.next_frame() => result,
            };
            let failed = result.is_err();
            if frames.send(result).await.is_err() || failed {
                break;
            }
        }
        debug!(frames = source.frames_read(), "Frame reader task ended");
    }

    /// Writer task - sends queued commands one complete frame at a time
    ///
    /// On cancellation the commands already queued are still written.
    async fn writer_task<W>(
        mut writer: W,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let command = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    while let Ok(command) = commands.try_recv() {
                        debug!(command = command.name(), "Flushing command on close");
                        write_frame(&mut writer, &command.to_frame()).await?;
                    }
                    return Ok(());
                }
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => return Ok(()),
                },
            };
            debug!(command = command.name(), "Sending command");
            write_frame(&mut writer, &command.to_frame()).await?;
        }
    }
}

/// State owned by the pipeline task.
struct Pipeline {
    machine: AssayMachine,
    commands: mpsc::UnboundedSender<Command>,
    session_tx: watch::Sender<Arc<SessionState>>,
    catalogue_tx: watch::Sender<Arc<AssayCatalogue>>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl Pipeline {
    async fn run(
        mut self,
        mut frames: mpsc::Receiver<Result<Frame>>,
        mut intents: mpsc::Receiver<IntentRequest>,
        mut writer: JoinHandle<Result<()>>,
        cancel: CancellationToken,
    ) {
        info!("Protocol pipeline started");
        let mut frame_count = 0u64;

        let reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break "connection closed".to_string(),
                frame = frames.recv() => match frame {
                    Some(Ok(frame)) => {
                        frame_count += 1;
                        if let Err(e) = self.on_frame(frame) {
                            error!(error = %e, "Fatal protocol error");
                            break e.to_string();
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, frames = frame_count, "Frame stream ended");
                        break e.to_string();
                    }
                    None => break "frame reader stopped".to_string(),
                },
                Some(request) = intents.recv() => {
                    if let Err(e) = self.on_intent(request) {
                        error!(error = %e, "Command queue closed");
                        break e.to_string();
                    }
                }
                result = &mut writer => {
                    let reason = match result {
                        Ok(Ok(())) if cancel.is_cancelled() => break "connection closed".to_string(),
                        Ok(Ok(())) => "command writer stopped".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => format!("command writer failed: {}", e),
                    };
                    error!(reason = %reason, "Command writer ended");
                    break reason;
                }
            }
        };

        cancel.cancel();
        info!(frames = frame_count, reason = %reason, "Protocol pipeline ended");
        let _ = self.event_tx.send(EngineEvent::Disconnected { reason });
    }

    /// Classify and apply one frame. Only a fatal error ends the session.
    fn on_frame(&mut self, frame: Frame) -> Result<()> {
        match packet::classify(&frame) {
            Ok(packet) => {
                let output = self.machine.handle_packet(packet, now());
                self.dispatch(output)?;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(type_code = %frame.type_code, len = frame.payload.len(), error = %e, "Dropping undecodable frame");
                let _ = self.event_tx.send(EngineEvent::DecodeFailure {
                    type_code: frame.type_code,
                    payload: frame.payload,
                    error: e.to_string(),
                });
            }
        }
        self.publish();
        Ok(())
    }

    fn on_intent(&mut self, request: IntentRequest) -> Result<()> {
        let IntentRequest { intent, reply } = request;
        let name = intent.name();
        let verdict = match self.machine.handle_intent(intent) {
            Ok(commands) => {
                self.queue(commands)?;
                self.publish();
                Ok(())
            }
            Err(e) => {
                debug!(intent = name, error = %e, "Intent rejected");
                Err(e)
            }
        };
        let _ = reply.send(verdict);
        Ok(())
    }

    /// Snapshots are published before any event is broadcast.
    fn dispatch(&mut self, output: Output) -> Result<()> {
        self.queue(output.commands)?;
        self.publish();
        for event in output.events {
            // No subscribers is not an error
            let _ = self.event_tx.send(event);
        }
        Ok(())
    }

    fn queue(&self, commands: Vec<Command>) -> Result<()> {
        for command in commands {
            self.commands.send(command).map_err(|_| ProtocolError::Closed)?;
        }
        Ok(())
    }

    /// Publish snapshots that changed since the last publish.
    fn publish(&self) {
        let session = self.machine.session();
        self.session_tx.send_if_modified(|current| {
            if current.as_ref() == session {
                return false;
            }
            *current = Arc::new(session.clone());
            true
        });

        let catalogue = self.machine.catalogue();
        self.catalogue_tx.send_if_modified(|current| {
            if current.len() == catalogue.len() {
                return false;
            }
            *current = Arc::new(catalogue.clone());
            true
        });
    }
}

fn now() -> chrono::NaiveDateTime {
    chrono::Local::now().naive_local()
}
