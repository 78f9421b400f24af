//! The external interface engine.
//!
//! One engine instance owns one transport and drives the single
//! read/dispatch loop over it. Inbound frames are reassembled in a growing
//! receive buffer, trimmed after every decoded frame, and dispatched
//! strictly in arrival order to the handler registered for the command
//! name. Handlers run synchronously inside the loop, so they must not
//! block; long-running adapter work goes onto background tasks that hand
//! completed reports back through the clonable [`ExternalHandle`].
//!
//! Lifecycle: `Connecting → Running → Draining | Killed → Terminated`.
//! [`spindown`][ExternalHandle::spindown] is the graceful path (drain
//! already-queued outbound frames, then stop), [`kill`][ExternalHandle::kill]
//! the immediate one (abort registered tasks, run exit callbacks in order,
//! discard unsent output). A terminated engine never restarts.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            AtomicU32,
            Ordering,
        },
    },
    time::Duration,
};

use bytes::{
    Buf,
    Bytes,
    BytesMut,
};
use parking_lot::Mutex;
use tokio::{
    sync::{
        Notify,
        mpsc,
    },
    task::JoinHandle,
    time::{
        Instant,
        MissedTickBehavior,
    },
};
use wavecap_proto::{
    command,
    envelope::{
        Envelope,
        EnvelopeError,
    },
    frame::{
        self,
        FrameError,
    },
    messages::{
        MessageType,
        MsgbusMessage,
        Ping,
        Pong,
    },
};

use crate::transport::{
    Transport,
    TransportError,
};

/// Default liveness window: a missing PONG for longer than this is fatal.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transport error")]
    Transport(#[from] TransportError),

    #[error("framing error")]
    Frame(#[from] FrameError),

    #[error("envelope error")]
    Envelope(#[from] EnvelopeError),

    #[error("connection to host lost")]
    ConnectionLost,

    #[error("no PONG from host within {window:?}")]
    PongTimeout { window: Duration },
}

/// Error for sends issued through an [`ExternalHandle`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("envelope error")]
    Envelope(#[from] EnvelopeError),

    #[error("engine terminated")]
    Terminated,
}

type Handler = Box<dyn FnMut(&ExternalHandle, u32, &Bytes) + Send>;

type ExitCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Default)]
struct Supervised {
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    outbound: mpsc::UnboundedSender<Bytes>,
    seqno: AtomicU32,
    running: AtomicBool,
    kill_requested: AtomicBool,
    graceful_spindown: AtomicBool,
    cleanup_done: AtomicBool,
    last_pong: Mutex<Option<Instant>>,
    supervised: Mutex<Supervised>,
    exit_callbacks: Mutex<Vec<ExitCallback>>,
    notify: Notify,
}

impl Shared {
    fn kill(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
        self.cleanup();
        self.notify.notify_one();
    }

    /// Aborts supervised tasks and runs exit callbacks, exactly once.
    fn cleanup(&self) {
        if self.cleanup_done.swap(true, Ordering::SeqCst) {
            return;
        }

        let supervised = std::mem::take(&mut *self.supervised.lock());
        for task in supervised.tasks {
            task.abort();
        }

        let callbacks = std::mem::take(&mut *self.exit_callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }
}

/// Clonable, thread-safe handle to a running engine.
///
/// All outbound work goes through this: frames are handed to the engine
/// loop over a FIFO queue, so concurrent producers keep their own issue
/// order and never block.
#[derive(Clone)]
pub struct ExternalHandle {
    shared: Arc<Shared>,
}

impl ExternalHandle {
    /// Wraps `content` in an envelope, assigns the next sequence number and
    /// queues the frame for writing. Returns the assigned sequence number.
    pub fn send_packet(
        &self,
        command: &str,
        content: impl Into<Bytes>,
    ) -> Result<u32, SendError> {
        let seqno = self.shared.seqno.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope::new(command, seqno, content);
        let payload = envelope.encode()?;

        self.shared
            .outbound
            .send(frame::encode(&payload))
            .map_err(|_| SendError::Terminated)?;
        self.shared.notify.notify_one();

        Ok(seqno)
    }

    /// Sends a MESSAGE for the host's message bus.
    pub fn send_message(&self, text: &str, msgtype: MessageType) {
        let content = serde_json::to_vec(&MsgbusMessage::new(text, msgtype))
            .unwrap_or_default();
        if let Err(error) = self.send_packet(command::MESSAGE, content) {
            tracing::debug!(?error, "failed to queue MESSAGE");
        }
    }

    /// Sends a PING and starts liveness tracking if it wasn't active yet.
    pub fn send_ping(&self) {
        {
            let mut last_pong = self.shared.last_pong.lock();
            if last_pong.is_none() {
                *last_pong = Some(Instant::now());
            }
        }

        let content = serde_json::to_vec(&Ping {}).unwrap_or_default();
        if let Err(error) = self.send_packet(command::PING, content) {
            tracing::debug!(?error, "failed to queue PING");
        }
    }

    fn send_pong(&self, ping_seqno: u32) {
        let content = serde_json::to_vec(&Pong { ping_seqno }).unwrap_or_default();
        if let Err(error) = self.send_packet(command::PONG, content) {
            tracing::debug!(?error, "failed to queue PONG");
        }
    }

    fn note_pong(&self) {
        *self.shared.last_pong.lock() = Some(Instant::now());
    }

    /// Registers a background task to be aborted when the engine is killed.
    pub fn add_task(&self, task: JoinHandle<()>) {
        if self.shared.kill_requested.load(Ordering::SeqCst) {
            task.abort();
            return;
        }
        self.shared.supervised.lock().tasks.push(task);
    }

    /// Registers a callback run during kill, in registration order. Exit
    /// callbacks are the place to terminate spawned subprocesses so they
    /// don't leak as orphans.
    pub fn add_exit_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.exit_callbacks.lock().push(Box::new(callback));
    }

    /// Immediate shutdown: aborts tasks, runs exit callbacks, stops the
    /// loop, discarding unsent output.
    pub fn kill(&self) {
        self.shared.kill();
    }

    /// Graceful shutdown: the loop drains already-queued outbound frames,
    /// then terminates.
    pub fn spindown(&self) {
        self.shared.graceful_spindown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_killed(&self) -> bool {
        self.shared.kill_requested.load(Ordering::SeqCst)
    }

    pub fn in_spindown(&self) -> bool {
        self.shared.graceful_spindown.load(Ordering::SeqCst)
    }
}

/// The read/dispatch state machine over one transport.
pub struct Engine {
    transport: Transport,
    receive_buffer: BytesMut,
    handlers: HashMap<String, Handler>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
    handle: ExternalHandle,
    liveness_window: Duration,
}

impl Engine {
    pub fn new(transport: Transport) -> Self {
        let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            outbound: outbound_sender,
            seqno: AtomicU32::new(0),
            running: AtomicBool::new(false),
            kill_requested: AtomicBool::new(false),
            graceful_spindown: AtomicBool::new(false),
            cleanup_done: AtomicBool::new(false),
            last_pong: Mutex::new(None),
            supervised: Mutex::new(Default::default()),
            exit_callbacks: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });

        let handle = ExternalHandle {
            shared: shared.clone(),
        };

        let mut engine = Self {
            transport,
            receive_buffer: BytesMut::with_capacity(0x1000),
            handlers: HashMap::new(),
            outbound: outbound_receiver,
            shared,
            handle,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
        };

        engine.add_handler(command::PING, |handle, seqno, _content| {
            handle.send_pong(seqno);
        });
        engine.add_handler(command::PONG, |handle, _seqno, _content| {
            handle.note_pong();
        });
        engine.add_handler(command::SHUTDOWN, |handle, _seqno, _content| {
            tracing::info!("host requested shutdown");
            handle.kill();
        });

        engine
    }

    /// Overrides the liveness window (5 s by default).
    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    pub fn handle(&self) -> ExternalHandle {
        self.handle.clone()
    }

    /// Registers `handler` for `command`, replacing any prior handler for
    /// the same name.
    pub fn add_handler(
        &mut self,
        command: impl Into<String>,
        handler: impl FnMut(&ExternalHandle, u32, &Bytes) + Send + 'static,
    ) {
        self.handlers.insert(command.into(), Box::new(handler));
    }

    /// Runs the read/dispatch loop to termination.
    ///
    /// Returns `Ok(())` on peer-requested shutdown, [`kill`][ExternalHandle::kill]
    /// or a drained spindown; transport, framing and liveness failures are
    /// returned as errors after the engine has been killed. Either way the
    /// engine is terminated afterwards and cannot be restarted.
    pub async fn run(mut self) -> Result<(), EngineError> {
        self.shared.running.store(true, Ordering::SeqCst);

        let result = self.run_loop().await;

        self.shared.running.store(false, Ordering::SeqCst);
        self.transport.close().await;
        // exit callbacks must run on every termination path
        self.shared.kill();

        result
    }

    async fn run_loop(&mut self) -> Result<(), EngineError> {
        let mut liveness = tokio::time::interval(self.liveness_poll_interval());
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.shared.kill_requested.load(Ordering::SeqCst) {
                return Ok(());
            }

            if self.shared.graceful_spindown.load(Ordering::SeqCst) {
                // drain frames queued before the spindown request; anything
                // submitted afterwards is not waited for
                while let Ok(frame) = self.outbound.try_recv() {
                    self.transport.send(frame).await?;
                }
                return Ok(());
            }

            tokio::select! {
                result = self.transport.read_chunk(&mut self.receive_buffer) => {
                    if result? == 0 {
                        self.shared.kill();
                        return Err(EngineError::ConnectionLost);
                    }
                    self.dispatch_frames()?;
                }

                frame = self.outbound.recv() => {
                    if let Some(frame) = frame {
                        self.transport.send(frame).await?;
                    }
                }

                _ = self.shared.notify.notified() => {
                    // flags are re-checked at the top of the loop
                }

                _ = liveness.tick() => {
                    let last_pong = *self.shared.last_pong.lock();
                    if let Some(last_pong) = last_pong {
                        if last_pong.elapsed() > self.liveness_window {
                            self.shared.kill();
                            return Err(EngineError::PongTimeout {
                                window: self.liveness_window,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Decodes and dispatches every complete frame in the receive buffer,
    /// in arrival order.
    fn dispatch_frames(&mut self) -> Result<(), EngineError> {
        while let Some(decoded) = frame::try_decode(&self.receive_buffer)? {
            self.receive_buffer.advance(decoded.consumed);

            let envelope = Envelope::decode(decoded.payload)?;

            if let Some(handler) = self.handlers.get_mut(&envelope.command) {
                handler(&self.handle, envelope.seqno, &envelope.content);
            }
            else {
                tracing::warn!(command = %envelope.command, "unhandled command, dropping");
            }
        }

        Ok(())
    }

    fn liveness_poll_interval(&self) -> Duration {
        Duration::from_millis(((self.liveness_window.as_millis() / 4) as u64).max(10))
    }
}
