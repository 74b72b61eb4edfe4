//! One engine per app-server connection.
//!
//! [`ConnectionEngine`] is the handle; the engine itself runs on a dedicated
//! OS thread with a current-thread tokio runtime. Commands go in over an
//! unbounded control channel and every observable change comes back as an
//! [`EngineUpdate`] carrying a full [`EngineSnapshot`].

mod connector;
mod driver;
mod session;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub use connector::{StreamConnector, TcpConnector};
pub use session::{EngineCore, Reply, TimerKind, TimerRequest, normalize_directories};

use crate::error::{EngineError, EngineResult};
use crate::model::{ConnectionState, DirectoryListing, EngineSnapshot, SocketPhase, TaskRequest};
use crate::settings::EngineSettings;
use driver::EngineDriver;

/// A snapshot published by one engine instance.
#[derive(Debug, Clone)]
pub struct EngineUpdate {
    pub connection_id: String,
    /// Distinguishes a respawned engine from the one it replaced.
    pub instance: u64,
    pub snapshot: Box<EngineSnapshot>,
}

pub(crate) enum EngineControl {
    Connect(String),
    Disconnect,
    StartTask(TaskRequest),
    LoadThreadHistory(String),
    ListDirectories {
        cwd: Option<String>,
        reply: Reply<DirectoryListing>,
    },
    CreateThread {
        cwd: Option<String>,
        reply: Reply<String>,
    },
    ArchiveThread {
        thread_id: String,
        reply: Reply<()>,
    },
    RefreshThreadList,
    SelectThread(Option<String>),
    Shutdown,
}

/// State the handle checks synchronously before enqueueing a submission.
#[derive(Debug, Default)]
pub(crate) struct SubmitGate {
    pub(crate) connected: AtomicBool,
    pub(crate) submitting: AtomicBool,
}

pub struct ConnectionEngine {
    connection_id: String,
    control_tx: mpsc::UnboundedSender<EngineControl>,
    gate: Arc<SubmitGate>,
    join_handle: Option<JoinHandle<()>>,
    shutdown_sent: bool,
}

impl ConnectionEngine {
    pub fn spawn(
        connection_id: impl Into<String>,
        instance: u64,
        settings: EngineSettings,
        update_tx: mpsc::UnboundedSender<EngineUpdate>,
    ) -> Self {
        Self::spawn_with_connector(
            connection_id,
            instance,
            settings,
            Arc::new(TcpConnector),
            update_tx,
        )
    }

    pub fn spawn_with_connector(
        connection_id: impl Into<String>,
        instance: u64,
        settings: EngineSettings,
        connector: Arc<dyn StreamConnector>,
        update_tx: mpsc::UnboundedSender<EngineUpdate>,
    ) -> Self {
        let connection_id = connection_id.into();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(SubmitGate::default());

        let driver = EngineDriver::new(
            connection_id.clone(),
            instance,
            settings,
            connector,
            update_tx.clone(),
            Arc::clone(&gate),
        );
        let thread_connection_id = connection_id.clone();
        let join_handle = std::thread::spawn(move || {
            run_engine_loop(thread_connection_id, instance, driver, control_rx, update_tx);
        });

        Self {
            connection_id,
            control_tx,
            gate,
            join_handle: Some(join_handle),
            shutdown_sent: false,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn connect(&self, url: impl Into<String>) {
        self.send(EngineControl::Connect(url.into()));
    }

    pub fn disconnect(&self) {
        self.send(EngineControl::Disconnect);
    }

    /// Enqueue a submission. Returns false, sending nothing, when the engine
    /// is not connected, the prompt is blank, or a submission is in flight.
    pub fn start_task(&self, request: TaskRequest) -> bool {
        if request.prompt.trim().is_empty() || !self.gate.connected.load(Ordering::Acquire) {
            return false;
        }
        if self
            .gate
            .submitting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.control_tx.send(EngineControl::StartTask(request)).is_err() {
            self.gate.submitting.store(false, Ordering::Release);
            return false;
        }
        true
    }

    pub fn load_thread_history(&self, thread_id: impl Into<String>) {
        self.send(EngineControl::LoadThreadHistory(thread_id.into()));
    }

    pub async fn list_directories(&self, cwd: Option<String>) -> EngineResult<DirectoryListing> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineControl::ListDirectories { cwd, reply });
        settle(rx).await
    }

    pub async fn create_thread(&self, cwd: Option<String>) -> EngineResult<String> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineControl::CreateThread { cwd, reply });
        settle(rx).await
    }

    pub async fn archive_thread(&self, thread_id: impl Into<String>) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineControl::ArchiveThread {
            thread_id: thread_id.into(),
            reply,
        });
        settle(rx).await
    }

    pub fn refresh_thread_list(&self) {
        self.send(EngineControl::RefreshThreadList);
    }

    pub fn select_thread(&self, thread_id: Option<String>) {
        self.send(EngineControl::SelectThread(thread_id));
    }

    /// Ask the engine thread to stop. Does not wait for it.
    pub fn shutdown(&mut self) {
        if self.shutdown_sent {
            return;
        }
        self.shutdown_sent = true;
        let _ = self.control_tx.send(EngineControl::Shutdown);
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.is_finished() {
                let _ = join_handle.join();
            } else {
                debug!(connection_id = %self.connection_id, "detaching engine thread");
            }
        }
    }

    fn send(&self, control: EngineControl) {
        if self.control_tx.send(control).is_err() {
            warn!(connection_id = %self.connection_id, "engine offline, dropping command");
        }
    }
}

impl Drop for ConnectionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A dropped reply sender means the engine went away mid-request.
async fn settle<T>(rx: oneshot::Receiver<EngineResult<T>>) -> EngineResult<T> {
    rx.await.unwrap_or(Err(EngineError::Cancelled))
}

fn run_engine_loop(
    connection_id: String,
    instance: u64,
    driver: EngineDriver,
    control_rx: mpsc::UnboundedReceiver<EngineControl>,
    update_tx: mpsc::UnboundedSender<EngineUpdate>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            let snapshot = EngineSnapshot {
                state: ConnectionState::Failed,
                phase: SocketPhase::Closed,
                last_error: Some(format!("engine runtime initialization failed: {error}")),
                ..EngineSnapshot::default()
            };
            let _ = update_tx.send(EngineUpdate {
                connection_id,
                instance,
                snapshot: Box::new(snapshot),
            });
            return;
        }
    };
    runtime.block_on(driver.run(control_rx));
}
