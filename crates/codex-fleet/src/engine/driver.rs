//! Event loop that owns one engine's socket tasks and its [`EngineCore`].

use std::sync::Arc;
use std::sync::atomic::Ordering;

use codex_ws_client::{
    BoxedStream, ClientError, Frame, FrameReader, Message, WsTarget, candidate_urls,
    encode_client_frame, parse_endpoint, perform_handshake,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connector::StreamConnector;
use super::session::{EngineCore, TimerKind};
use super::{EngineControl, EngineUpdate, SubmitGate};
use crate::model::{EngineSnapshot, SocketPhase};
use crate::settings::EngineSettings;

const READ_CHUNK: usize = 16 * 1024;
const NORMAL_CLOSURE: u16 = 1000;
const ABNORMAL_CLOSURE: u16 = 1006;
const NO_STATUS: u16 = 1005;

struct TransportEvent {
    generation: u64,
    kind: TransportEventKind,
}

enum TransportEventKind {
    Handshaking,
    Opened {
        stream: BoxedStream,
        leftover: Vec<u8>,
    },
    ConnectFailed(ClientError),
    Message(Message),
    ReadFailed(ClientError),
    WriteFailed(ClientError),
    Timer(TimerKind),
}

/// Reader and writer tasks of an upgraded socket.
struct Link {
    writer_tx: mpsc::UnboundedSender<Frame>,
    reader: JoinHandle<()>,
}

pub(super) struct EngineDriver {
    connection_id: String,
    instance: u64,
    settings: EngineSettings,
    core: EngineCore,
    connector: Arc<dyn StreamConnector>,
    update_tx: mpsc::UnboundedSender<EngineUpdate>,
    gate: Arc<SubmitGate>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: mpsc::UnboundedReceiver<TransportEvent>,
    generation: u64,
    candidates: Vec<WsTarget>,
    candidate_index: usize,
    connect_task: Option<JoinHandle<()>>,
    link: Option<Link>,
    last_published: Option<EngineSnapshot>,
    was_submitting: bool,
}

impl EngineDriver {
    pub(super) fn new(
        connection_id: String,
        instance: u64,
        settings: EngineSettings,
        connector: Arc<dyn StreamConnector>,
        update_tx: mpsc::UnboundedSender<EngineUpdate>,
        gate: Arc<SubmitGate>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            connection_id,
            instance,
            core: EngineCore::new(settings.clone()),
            settings,
            connector,
            update_tx,
            gate,
            event_tx,
            event_rx,
            generation: 0,
            candidates: Vec::new(),
            candidate_index: 0,
            connect_task: None,
            link: None,
            last_published: None,
            was_submitting: false,
        }
    }

    pub(super) async fn run(mut self, mut control_rx: mpsc::UnboundedReceiver<EngineControl>) {
        self.publish(true);
        loop {
            tokio::select! {
                control = control_rx.recv() => match control {
                    Some(EngineControl::Shutdown) | None => {
                        self.teardown();
                        break;
                    }
                    Some(control) => self.handle_control(control),
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event),
            }
            self.settle();
        }
        debug!(connection_id = %self.connection_id, "engine stopped");
    }

    fn handle_control(&mut self, control: EngineControl) {
        match control {
            EngineControl::Connect(url) => self.connect(&url),
            EngineControl::Disconnect => {
                self.teardown();
                self.core.disconnect();
                info!(connection_id = %self.connection_id, "disconnected by user");
            }
            EngineControl::StartTask(request) => {
                if !self.core.start_task(request) {
                    self.gate.submitting.store(false, Ordering::Release);
                }
            }
            EngineControl::LoadThreadHistory(thread_id) => {
                self.core.load_thread_history(&thread_id);
            }
            EngineControl::ListDirectories { cwd, reply } => self.core.list_directories(cwd, reply),
            EngineControl::CreateThread { cwd, reply } => self.core.create_thread(cwd, reply),
            EngineControl::ArchiveThread { thread_id, reply } => {
                self.core.archive_thread(&thread_id, reply);
            }
            EngineControl::RefreshThreadList => {
                self.core.refresh_thread_list();
            }
            EngineControl::SelectThread(thread_id) => self.core.select_thread(thread_id),
            EngineControl::Shutdown => {}
        }
    }

    fn connect(&mut self, url: &str) {
        self.teardown();
        let target = match parse_endpoint(url) {
            Ok(target) => target,
            Err(error) => {
                self.core.begin_connect(url);
                self.core.fail(error.to_string());
                return;
            }
        };
        self.core.begin_connect(target.as_str());
        self.candidates = candidate_urls(&target);
        self.candidate_index = 0;
        self.dial();
    }

    /// Start a connect attempt against the current candidate.
    fn dial(&mut self) {
        let Some(target) = self.candidates.get(self.candidate_index).cloned() else {
            return;
        };
        self.core.set_phase(SocketPhase::Connecting);
        info!(
            connection_id = %self.connection_id,
            generation = self.generation,
            url = %target,
            "connecting"
        );

        let generation = self.generation;
        let events = self.event_tx.clone();
        let connector = Arc::clone(&self.connector);
        let timeout = self.settings.connect_timeout;
        self.connect_task = Some(tokio::spawn(async move {
            let attempt = async {
                let mut stream = connector.open(&target, timeout).await?;
                let _ = events.send(TransportEvent {
                    generation,
                    kind: TransportEventKind::Handshaking,
                });
                let leftover = perform_handshake(&mut stream, &target).await?;
                Ok::<_, ClientError>((stream, leftover))
            };
            let kind = match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok((stream, leftover))) => TransportEventKind::Opened { stream, leftover },
                Ok(Err(error)) => TransportEventKind::ConnectFailed(error),
                Err(_) => TransportEventKind::ConnectFailed(ClientError::Timeout(format!(
                    "no upgrade within {}s",
                    timeout.as_secs()
                ))),
            };
            let _ = events.send(TransportEvent { generation, kind });
        }));
    }

    fn handle_event(&mut self, event: TransportEvent) {
        if event.generation != self.generation {
            debug!(
                connection_id = %self.connection_id,
                generation = event.generation,
                "dropping stale transport event"
            );
            return;
        }
        match event.kind {
            TransportEventKind::Handshaking => self.core.set_phase(SocketPhase::Handshaking),
            TransportEventKind::Opened { stream, leftover } => {
                self.connect_task = None;
                info!(connection_id = %self.connection_id, "socket open");
                self.open_link(stream, leftover);
                self.core.on_open();
            }
            TransportEventKind::ConnectFailed(error) => {
                self.connect_task = None;
                if self.candidate_index + 1 < self.candidates.len() {
                    warn!(
                        connection_id = %self.connection_id,
                        error = %error,
                        "connect attempt failed, trying next candidate"
                    );
                    self.candidate_index += 1;
                    self.dial();
                } else {
                    self.teardown();
                    self.core.fail(error.to_string());
                }
            }
            TransportEventKind::Message(message) => self.handle_message(message),
            TransportEventKind::ReadFailed(error) | TransportEventKind::WriteFailed(error) => {
                self.teardown();
                self.core.fail(error.to_string());
            }
            TransportEventKind::Timer(kind) => self.core.on_timer(kind),
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Text(text) => self.core.handle_text(&text),
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => self.core.handle_text(&text),
                Err(_) => debug!(connection_id = %self.connection_id, "dropping binary frame"),
            },
            Message::Ping(payload) => {
                if let Some(link) = &self.link {
                    let _ = link.writer_tx.send(Frame::pong(&payload));
                }
            }
            Message::Pong(_) => {}
            Message::Close { code, reason } => {
                let error = ClientError::Closed {
                    code: code.unwrap_or(NO_STATUS),
                    reason: if reason.is_empty() {
                        "closed by server".to_string()
                    } else {
                        reason
                    },
                };
                self.teardown();
                self.core.fail(error.to_string());
            }
        }
    }

    fn open_link(&mut self, stream: BoxedStream, leftover: Vec<u8>) {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let generation = self.generation;

        let events = self.event_tx.clone();
        let reader = tokio::spawn(async move {
            let mut frames = FrameReader::new();
            frames.push(&leftover);
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                loop {
                    match frames.next_message() {
                        Ok(Some(message)) => {
                            let closing = matches!(message, Message::Close { .. });
                            let kind = TransportEventKind::Message(message);
                            if events.send(TransportEvent { generation, kind }).is_err() || closing {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            let kind = TransportEventKind::ReadFailed(error.into());
                            let _ = events.send(TransportEvent { generation, kind });
                            return;
                        }
                    }
                }
                let kind = match read_half.read(&mut chunk).await {
                    Ok(0) => TransportEventKind::ReadFailed(ClientError::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "connection closed without close frame".to_string(),
                    }),
                    Ok(read) => {
                        frames.push(&chunk[..read]);
                        continue;
                    }
                    Err(error) => TransportEventKind::ReadFailed(error.into()),
                };
                let _ = events.send(TransportEvent { generation, kind });
                return;
            }
        });

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Frame>();
        let events = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                let bytes = encode_client_frame(&frame);
                let written = async {
                    write_half.write_all(&bytes).await?;
                    write_half.flush().await
                };
                if let Err(error) = written.await {
                    let kind = TransportEventKind::WriteFailed(error.into());
                    let _ = events.send(TransportEvent { generation, kind });
                    return;
                }
            }
            let _ = write_half.shutdown().await;
        });

        self.link = Some(Link { writer_tx, reader });
    }

    /// Cancel the connect attempt or socket of the current generation.
    fn teardown(&mut self) {
        self.generation += 1;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            // The writer drains this close frame, then shuts the socket down.
            let _ = link
                .writer_tx
                .send(Frame::close(NORMAL_CLOSURE, "client closing"));
            link.reader.abort();
        }
        self.candidates.clear();
        self.candidate_index = 0;
    }

    /// Apply side effects queued by the core during the last step.
    fn settle(&mut self) {
        if let Some(message) = self.core.take_fatal() {
            self.teardown();
            self.core.fail(message);
        }

        if let Some(link) = &self.link {
            for text in self.core.take_outbox() {
                if link.writer_tx.send(Frame::text(&text)).is_err() {
                    break;
                }
            }
        }

        for timer in self.core.take_timers() {
            let events = self.event_tx.clone();
            let generation = self.generation;
            tokio::spawn(async move {
                tokio::time::sleep(timer.delay).await;
                let kind = TransportEventKind::Timer(timer.kind);
                let _ = events.send(TransportEvent { generation, kind });
            });
        }

        self.gate
            .connected
            .store(self.core.is_connected(), Ordering::Release);
        let submitting = self.core.submitting();
        if self.was_submitting && !submitting {
            self.gate.submitting.store(false, Ordering::Release);
        }
        self.was_submitting = submitting;

        self.publish(false);
    }

    fn publish(&mut self, force: bool) {
        if !self.core.take_dirty() && !force {
            return;
        }
        let snapshot = self.core.snapshot();
        if self.last_published.as_ref() == Some(&snapshot) {
            return;
        }
        let update = EngineUpdate {
            connection_id: self.connection_id.clone(),
            instance: self.instance,
            snapshot: Box::new(snapshot.clone()),
        };
        if self.update_tx.send(update).is_err() {
            debug!(connection_id = %self.connection_id, "update receiver gone");
        }
        self.last_published = Some(snapshot);
    }
}
