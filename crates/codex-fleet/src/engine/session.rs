//! Protocol state for one connection, independent of sockets and threads.
//!
//! The driver feeds decoded text and lifecycle transitions in; the core
//! answers with queued outbound envelopes, timer requests, and a dirty flag.
//! Every mutation of request, correlation, and thread state happens here.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use codex_ws_client::{
    AppServerRequestId, CollaborationModeListParams, CommandExecParams, CommandExecResponse,
    Incoming, InitializeCapabilities, InitializeParams, ItemPayload, ModelListParams,
    NormalizedEvent, ReasoningEffort, RpcDispatcher, RpcError, ServerEvent, ThreadArchiveParams,
    ThreadListParams, ThreadReadParams, ThreadResumeParams, ThreadSortKey, ThreadSourceKind,
    ThreadStartParams, TurnStartParams, UserInput, normalize_notification, parse_incoming,
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::correlator::Correlator;
use crate::error::{EngineError, EngineResult};
use crate::history::{
    UNTITLED_THREAD, activity_from_turns, merge_thread, placeholder_thread,
    sanitize_assistant_text, string_field, task_name_for_item, thread_from_value, title_from_text,
};
use crate::model::{
    ActivityEntry, ActivityKind, CollaborationModeOption, ConnectionState, DirectoryListing,
    EngineSnapshot, ModelOption, RunningTask, SocketPhase, TaskKind, TaskRequest, ThreadInfo,
};
use crate::settings::EngineSettings;

pub type Reply<T> = oneshot::Sender<EngineResult<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ThreadListRetry { epoch: u64, attempt: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub delay: Duration,
    pub kind: TimerKind,
}

/// What a pending request's response will be applied to.
pub(crate) enum PendingContext {
    Initialize,
    ThreadList {
        epoch: u64,
        attempt: u32,
        continuation: bool,
        minimal: bool,
    },
    ThreadSummary {
        epoch: u64,
        thread_id: String,
    },
    ModelList,
    CollaborationModeList,
    TaskThread {
        requested: Option<String>,
    },
    TurnStart {
        thread_id: String,
    },
    HistoryResume {
        thread_id: String,
    },
    HistoryRead {
        thread_id: String,
    },
    CreateThread {
        reply: Reply<String>,
    },
    ArchiveThread {
        thread_id: String,
        reply: Reply<()>,
    },
    ResolvePwd {
        reply: Reply<DirectoryListing>,
    },
    ListDirectories {
        cwd: String,
        reply: Reply<DirectoryListing>,
    },
}

impl PendingContext {
    fn cancel(self) {
        match self {
            Self::CreateThread { reply } => {
                let _ = reply.send(Err(EngineError::Cancelled));
            }
            Self::ArchiveThread { reply, .. } => {
                let _ = reply.send(Err(EngineError::Cancelled));
            }
            Self::ResolvePwd { reply } | Self::ListDirectories { reply, .. } => {
                let _ = reply.send(Err(EngineError::Cancelled));
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct ThreadListState {
    epoch: u64,
    scratch: Vec<ThreadInfo>,
    outstanding: HashSet<String>,
    terminal: bool,
}

enum ThreadEntry {
    Full(ThreadInfo),
    Id(String),
}

pub struct EngineCore {
    settings: EngineSettings,
    rpc: RpcDispatcher<PendingContext>,
    correlator: Correlator,
    state: ConnectionState,
    phase: SocketPhase,
    url: Option<String>,
    last_error: Option<String>,
    threads: HashMap<String, ThreadInfo>,
    tasks: HashMap<String, RunningTask>,
    activity: Vec<ActivityEntry>,
    /// Raw streamed assistant text keyed by item id.
    streams: HashMap<String, String>,
    models: Vec<ModelOption>,
    model_scratch: Vec<ModelOption>,
    modes: Vec<CollaborationModeOption>,
    current_thread_id: Option<String>,
    submitted_task_count: u64,
    pending_task: Option<TaskRequest>,
    thread_list: ThreadListState,
    outbox: Vec<String>,
    timers: Vec<TimerRequest>,
    fatal: Option<String>,
    dirty: bool,
}

impl EngineCore {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            rpc: RpcDispatcher::new(),
            correlator: Correlator::new(),
            state: ConnectionState::Disconnected,
            phase: SocketPhase::Idle,
            url: None,
            last_error: None,
            threads: HashMap::new(),
            tasks: HashMap::new(),
            activity: Vec::new(),
            streams: HashMap::new(),
            models: Vec::new(),
            model_scratch: Vec::new(),
            modes: Vec::new(),
            current_thread_id: None,
            submitted_task_count: 0,
            pending_task: None,
            thread_list: ThreadListState::default(),
            outbox: Vec::new(),
            timers: Vec::new(),
            fatal: None,
            dirty: true,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn phase(&self) -> SocketPhase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn submitting(&self) -> bool {
        self.pending_task.is_some()
    }

    pub fn pending_requests(&self) -> usize {
        self.rpc.pending_len()
    }

    pub fn take_outbox(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_timers(&mut self) -> Vec<TimerRequest> {
        std::mem::take(&mut self.timers)
    }

    /// A protocol error that must tear the connection down.
    pub fn take_fatal(&mut self) -> Option<String> {
        self.fatal.take()
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let mut threads: Vec<ThreadInfo> = self.threads.values().cloned().collect();
        threads.sort_by(|left, right| {
            right
                .updated_at
                .cmp(&left.updated_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        let mut tasks: Vec<RunningTask> = self.tasks.values().cloned().collect();
        tasks.sort_by(|left, right| {
            right
                .started_at
                .cmp(&left.started_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        EngineSnapshot {
            state: self.state,
            phase: self.phase,
            url: self.url.clone(),
            last_error: self.last_error.clone(),
            threads,
            tasks,
            activity: self.activity.clone(),
            models: self.models.clone(),
            collaboration_modes: self.modes.clone(),
            current_thread_id: self.current_thread_id.clone(),
            submitted_task_count: self.submitted_task_count,
            submitting: self.submitting(),
        }
    }

    // Lifecycle

    /// Start a fresh session. Nothing observed on a previous socket survives.
    pub fn begin_connect(&mut self, url: &str) {
        self.reset_tracking();
        self.threads.clear();
        self.activity.clear();
        self.current_thread_id = None;
        self.models.clear();
        self.modes.clear();
        self.url = Some(url.to_string());
        self.state = ConnectionState::Connecting;
        self.phase = SocketPhase::Connecting;
        self.last_error = None;
        self.dirty = true;
    }

    pub fn set_phase(&mut self, phase: SocketPhase) {
        if self.phase != phase {
            self.phase = phase;
            self.dirty = true;
        }
    }

    /// Socket upgraded; start protocol negotiation.
    pub fn on_open(&mut self) {
        self.set_phase(SocketPhase::Open);
        let params = InitializeParams {
            client_info: self.settings.client_info.clone(),
            capabilities: Some(InitializeCapabilities {
                experimental_api: true,
            }),
        };
        self.send_request("initialize", to_params(&params), PendingContext::Initialize);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(url = ?self.url, error = %message, "connection failed");
        self.reset_tracking();
        self.state = ConnectionState::Failed;
        self.phase = SocketPhase::Closed;
        self.last_error = Some(message);
        self.dirty = true;
    }

    /// User-initiated teardown. A failed state stays visible.
    pub fn disconnect(&mut self) {
        self.reset_tracking();
        self.phase = SocketPhase::Idle;
        if self.state != ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
        self.dirty = true;
    }

    fn reset_tracking(&mut self) {
        let dropped = self.rpc.drain();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropping pending requests");
        }
        for pending in dropped {
            pending.context.cancel();
        }
        self.correlator.clear();
        self.tasks.clear();
        self.streams.clear();
        self.pending_task = None;
        self.thread_list.epoch += 1;
        self.thread_list.scratch.clear();
        self.thread_list.outstanding.clear();
        self.thread_list.terminal = false;
        self.model_scratch.clear();
        self.outbox.clear();
        self.timers.clear();
        self.fatal = None;
    }

    // Incoming traffic

    pub fn handle_text(&mut self, text: &str) {
        for incoming in parse_incoming(text) {
            match incoming {
                Incoming::Response { id, outcome } => self.handle_response(&id, outcome),
                Incoming::Notification { method, params } => {
                    self.handle_notification(&method, &params);
                }
                Incoming::Request { id, method, .. } => self.decline_server_request(&id, &method),
            }
        }
    }

    fn handle_response(&mut self, id: &AppServerRequestId, outcome: Result<Value, RpcError>) {
        let Some(pending) = self.rpc.resolve(id) else {
            debug!(?id, "response without pending request");
            return;
        };
        if let Err(error) = &outcome {
            debug!(method = %pending.method, error = %error, "request failed");
        }
        match pending.context {
            PendingContext::Initialize => self.on_initialize(outcome),
            PendingContext::ThreadList {
                epoch,
                attempt,
                continuation,
                minimal,
            } => self.on_thread_list(epoch, attempt, continuation, minimal, outcome),
            PendingContext::ThreadSummary { epoch, thread_id } => {
                self.on_thread_summary(epoch, &thread_id, outcome);
            }
            PendingContext::ModelList => self.on_model_list(outcome),
            PendingContext::CollaborationModeList => self.on_collaboration_modes(outcome),
            PendingContext::TaskThread { requested } => self.on_task_thread(requested, outcome),
            PendingContext::TurnStart { thread_id } => self.on_turn_start(&thread_id, outcome),
            PendingContext::HistoryResume { thread_id } => {
                if let Err(error) = outcome {
                    debug!(thread_id = %thread_id, error = %error, "history resume failed");
                }
                let params = ThreadReadParams {
                    thread_id: thread_id.clone(),
                    include_turns: true,
                };
                self.send_request(
                    "thread/read",
                    to_params(&params),
                    PendingContext::HistoryRead { thread_id },
                );
            }
            PendingContext::HistoryRead { thread_id } => self.on_history_read(&thread_id, outcome),
            PendingContext::CreateThread { reply } => self.on_create_thread(reply, outcome),
            PendingContext::ArchiveThread { thread_id, reply } => match outcome {
                Ok(_) => {
                    self.remove_thread(&thread_id);
                    let _ = reply.send(Ok(()));
                }
                Err(error) => {
                    let _ = reply.send(Err(EngineError::Rejected(error.message)));
                }
            },
            PendingContext::ResolvePwd { reply } => self.on_resolve_pwd(reply, outcome),
            PendingContext::ListDirectories { cwd, reply } => {
                let result = command_output(outcome)
                    .map(|stdout| DirectoryListing {
                        directories: normalize_directories(&cwd, &stdout),
                        cwd,
                    });
                let _ = reply.send(result);
            }
        }
    }

    fn decline_server_request(&mut self, id: &AppServerRequestId, method: &str) {
        debug!(method, ?id, "declining server request");
        match self.rpc.unsupported_reply(id, method) {
            Ok(text) => self.outbox.push(text),
            Err(error) => warn!(error = %error, "failed to encode server request reply"),
        }
    }

    fn on_initialize(&mut self, outcome: Result<Value, RpcError>) {
        match outcome {
            Ok(_) => {}
            Err(error) if error.is_already_initialized() => {
                debug!("server reports already initialized");
            }
            Err(error) => {
                self.fatal = Some(format!("Initialize failed: {}", error.message));
                return;
            }
        }

        match self.rpc.notification("initialized", None) {
            Ok(text) => self.outbox.push(text),
            Err(error) => warn!(error = %error, "failed to encode initialized notification"),
        }
        self.state = ConnectionState::Connected;
        self.last_error = None;
        self.dirty = true;
        info!(url = ?self.url, "app-server session ready");

        self.refresh_thread_list();
        self.request_models(None);
        self.send_request(
            "collaborationMode/list",
            to_params(&CollaborationModeListParams::default()),
            PendingContext::CollaborationModeList,
        );
    }

    // Thread list

    /// Start a fresh, cursor-reset thread listing.
    pub fn refresh_thread_list(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.thread_list.epoch += 1;
        self.thread_list.scratch.clear();
        self.thread_list.outstanding.clear();
        self.thread_list.terminal = false;
        self.request_thread_page(None, 0, false);
        true
    }

    fn request_thread_page(&mut self, cursor: Option<String>, attempt: u32, minimal: bool) {
        let continuation = cursor.is_some();
        let params = if minimal {
            ThreadListParams {
                cursor,
                limit: Some(self.settings.thread_list_page_size),
                ..ThreadListParams::default()
            }
        } else {
            ThreadListParams {
                cursor,
                limit: Some(self.settings.thread_list_page_size),
                sort_key: Some(ThreadSortKey::UpdatedAt),
                source_kinds: Some(ThreadSourceKind::INTERACTIVE.to_vec()),
            }
        };
        let context = PendingContext::ThreadList {
            epoch: self.thread_list.epoch,
            attempt,
            continuation,
            minimal,
        };
        self.send_request("thread/list", to_params(&params), context);
    }

    fn on_thread_list(
        &mut self,
        epoch: u64,
        attempt: u32,
        continuation: bool,
        minimal: bool,
        outcome: Result<Value, RpcError>,
    ) {
        if epoch != self.thread_list.epoch {
            debug!(epoch, "discarding stale thread list page");
            return;
        }

        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                if !continuation && self.schedule_thread_list_retry(attempt) {
                    return;
                }
                warn!(error = %error, attempt, "thread list failed");
                self.thread_list.terminal = true;
                self.finish_thread_list();
                return;
            }
        };

        let (entries, next_cursor) = parse_thread_page(&result);
        for entry in entries {
            match entry {
                ThreadEntry::Full(info) => self.scratch_upsert(info),
                ThreadEntry::Id(id) => self.scratch_id(&id, epoch),
            }
        }

        if let Some(cursor) = next_cursor {
            self.request_thread_page(Some(cursor), attempt, minimal);
            return;
        }
        if !continuation
            && self.thread_list.scratch.is_empty()
            && self.schedule_thread_list_retry(attempt)
        {
            return;
        }
        self.thread_list.terminal = true;
        self.finish_thread_list();
    }

    fn scratch_id(&mut self, id: &str, epoch: u64) {
        if let Some(known) = self.threads.get(id).filter(|thread| !thread.placeholder) {
            let known = known.clone();
            self.scratch_upsert(known);
            return;
        }
        let resolved = self
            .thread_list
            .scratch
            .iter()
            .any(|thread| thread.id == id && !thread.placeholder);
        if resolved || self.thread_list.outstanding.contains(id) {
            return;
        }
        self.scratch_upsert(placeholder_thread(id));
        self.thread_list.outstanding.insert(id.to_string());
        let params = ThreadReadParams {
            thread_id: id.to_string(),
            include_turns: false,
        };
        self.send_request(
            "thread/read",
            to_params(&params),
            PendingContext::ThreadSummary {
                epoch,
                thread_id: id.to_string(),
            },
        );
    }

    fn schedule_thread_list_retry(&mut self, attempt: u32) -> bool {
        let Some(delay) = self
            .settings
            .thread_list_retry_delays
            .get(attempt as usize)
            .copied()
        else {
            return false;
        };
        self.thread_list.epoch += 1;
        self.thread_list.scratch.clear();
        self.thread_list.outstanding.clear();
        self.thread_list.terminal = false;
        debug!(attempt = attempt + 1, ?delay, "retrying thread list");
        self.timers.push(TimerRequest {
            delay,
            kind: TimerKind::ThreadListRetry {
                epoch: self.thread_list.epoch,
                attempt: attempt + 1,
            },
        });
        true
    }

    fn on_thread_summary(&mut self, epoch: u64, thread_id: &str, outcome: Result<Value, RpcError>) {
        if epoch != self.thread_list.epoch {
            return;
        }
        self.thread_list.outstanding.remove(thread_id);
        match outcome {
            Ok(result) => {
                let thread = result.get("thread").unwrap_or(&result);
                if let Some(info) = thread_from_value(thread, Utc::now())
                    && info.id == thread_id
                {
                    self.scratch_upsert(info);
                }
            }
            Err(error) => debug!(thread_id, error = %error, "thread summary failed"),
        }
        self.finish_thread_list();
    }

    fn scratch_upsert(&mut self, info: ThreadInfo) {
        match self
            .thread_list
            .scratch
            .iter_mut()
            .find(|thread| thread.id == info.id)
        {
            Some(existing) => merge_thread(existing, info),
            None => self.thread_list.scratch.push(info),
        }
    }

    fn finish_thread_list(&mut self) {
        if !self.thread_list.terminal || !self.thread_list.outstanding.is_empty() {
            return;
        }
        self.thread_list.terminal = false;
        let merged = std::mem::take(&mut self.thread_list.scratch);
        debug!(count = merged.len(), "publishing thread list");
        for info in merged {
            self.upsert_thread(info);
        }
        self.dirty = true;
    }

    pub fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ThreadListRetry { epoch, attempt } => {
                if epoch != self.thread_list.epoch || !self.is_connected() {
                    return;
                }
                self.request_thread_page(None, attempt, attempt == 1);
            }
        }
    }

    // Catalogs

    fn request_models(&mut self, cursor: Option<String>) {
        if cursor.is_none() {
            self.model_scratch.clear();
        }
        let params = ModelListParams {
            cursor,
            limit: Some(self.settings.model_page_size),
        };
        self.send_request("model/list", to_params(&params), PendingContext::ModelList);
    }

    fn on_model_list(&mut self, outcome: Result<Value, RpcError>) {
        match outcome {
            Ok(result) => {
                for model in data_array(&result).iter().filter_map(model_from_value) {
                    if !self.model_scratch.iter().any(|known| known.id == model.id) {
                        self.model_scratch.push(model);
                    }
                }
                if let Some(cursor) = next_cursor(&result) {
                    self.request_models(Some(cursor));
                    return;
                }
            }
            Err(error) => {
                warn!(error = %error, "model list failed");
                if self.model_scratch.is_empty() {
                    return;
                }
            }
        }
        self.models = std::mem::take(&mut self.model_scratch);
        self.dirty = true;
    }

    fn on_collaboration_modes(&mut self, outcome: Result<Value, RpcError>) {
        match outcome {
            Ok(result) => {
                self.modes = data_array(&result)
                    .iter()
                    .filter_map(collaboration_mode_from_value)
                    .collect();
                self.dirty = true;
            }
            Err(error) => debug!(error = %error, "collaboration modes unavailable"),
        }
    }

    // Commands

    /// Submit a prompt. Returns false without sending when not accepted.
    pub fn start_task(&mut self, request: TaskRequest) -> bool {
        if !self.is_connected() || request.prompt.trim().is_empty() || self.pending_task.is_some()
        {
            return false;
        }

        let requested = request.thread_id.clone().filter(|id| !id.is_empty());
        let sent = match &requested {
            Some(thread_id) => {
                let params = ThreadResumeParams {
                    thread_id: thread_id.clone(),
                    model: request.model.clone(),
                    cwd: request.cwd.clone(),
                };
                self.send_request(
                    "thread/resume",
                    to_params(&params),
                    PendingContext::TaskThread {
                        requested: requested.clone(),
                    },
                )
            }
            None => {
                let params = ThreadStartParams {
                    model: request.model.clone(),
                    cwd: request.cwd.clone(),
                };
                self.send_request(
                    "thread/start",
                    to_params(&params),
                    PendingContext::TaskThread { requested: None },
                )
            }
        };
        if sent.is_none() {
            return false;
        }
        self.pending_task = Some(request);
        self.dirty = true;
        true
    }

    fn on_task_thread(&mut self, requested: Option<String>, outcome: Result<Value, RpcError>) {
        let Some(task) = self.pending_task.clone() else {
            return;
        };
        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                self.pending_task = None;
                self.activity.push(ActivityEntry::system(
                    requested,
                    format!("Failed to start thread: {}", error.message),
                ));
                self.dirty = true;
                return;
            }
        };

        let now = Utc::now();
        let thread_value = result.get("thread");
        let thread_id = thread_value
            .and_then(|thread| string_field(thread, "id"))
            .or_else(|| string_field(&result, "threadId"))
            .or(requested);
        let Some(thread_id) = thread_id else {
            self.pending_task = None;
            self.activity.push(ActivityEntry::system(
                None,
                "Failed to start thread: response carried no thread id",
            ));
            self.dirty = true;
            return;
        };

        let mut info = thread_value
            .and_then(|thread| thread_from_value(thread, now))
            .unwrap_or_else(|| ThreadInfo {
                id: thread_id.clone(),
                cwd: None,
                title: title_from_text(&task.prompt),
                updated_at: now,
                placeholder: false,
            });
        if info.cwd.is_none() {
            info.cwd.clone_from(&task.cwd);
        }
        info.updated_at = now;
        if info.title == UNTITLED_THREAD {
            info.title = title_from_text(&task.prompt);
        }
        self.upsert_thread(info);
        self.current_thread_id = Some(thread_id.clone());
        self.activity.push(ActivityEntry {
            thread_id: Some(thread_id.clone()),
            timestamp: now,
            kind: ActivityKind::User,
            text: task.prompt.clone(),
            images: task.images.clone(),
            item_id: None,
        });

        let mut input = vec![UserInput::Text {
            text: task.prompt.clone(),
        }];
        input.extend(task.images.iter().map(|image| UserInput::image(image)));
        let params = TurnStartParams {
            thread_id: thread_id.clone(),
            input,
            cwd: task.cwd.as_ref().map(PathBuf::from),
            model: task.model.clone(),
            effort: task.effort,
            collaboration_mode: task
                .collaboration_mode
                .as_deref()
                .map(|name| self.collaboration_mode_param(name, &task)),
        };
        if self
            .send_request(
                "turn/start",
                to_params(&params),
                PendingContext::TurnStart { thread_id },
            )
            .is_none()
        {
            self.pending_task = None;
        }
        self.dirty = true;
    }

    fn collaboration_mode_param(&self, name: &str, task: &TaskRequest) -> Value {
        let known = self.modes.iter().find(|mode| mode.name == name);
        let mode = known
            .and_then(|mode| mode.mode.clone())
            .unwrap_or_else(|| name.to_string());
        let model = task
            .model
            .clone()
            .or_else(|| known.and_then(|mode| mode.model.clone()));
        let effort = task
            .effort
            .or_else(|| known.and_then(|mode| mode.reasoning_effort));
        json!({
            "mode": mode,
            "settings": {
                "model": model,
                "reasoning_effort": effort.map(ReasoningEffort::label),
                "developer_instructions": Value::Null,
            },
        })
    }

    fn on_turn_start(&mut self, thread_id: &str, outcome: Result<Value, RpcError>) {
        let task = self.pending_task.take();
        self.dirty = true;
        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                self.activity.push(ActivityEntry::system(
                    Some(thread_id.to_string()),
                    format!("Failed to start turn: {}", error.message),
                ));
                return;
            }
        };

        self.submitted_task_count += 1;
        let turn_id = result
            .get("turn")
            .and_then(|turn| string_field(turn, "id"))
            .or_else(|| string_field(&result, "turnId"));
        let Some(turn_id) = turn_id else {
            return;
        };
        self.correlator.record_turn(&turn_id, thread_id);
        let name = task
            .map(|task| title_from_text(&task.prompt))
            .unwrap_or_else(|| "Turn".to_string());
        self.tasks
            .entry(turn_task_id(&turn_id))
            .or_insert_with(|| RunningTask {
                id: turn_task_id(&turn_id),
                name,
                kind: TaskKind::Turn,
                thread_id: Some(thread_id.to_string()),
                turn_id: Some(turn_id.clone()),
                started_at: Utc::now(),
            });
    }

    /// Passive resume followed by a full read that replaces the thread's activity.
    pub fn load_thread_history(&mut self, thread_id: &str) -> bool {
        if !self.is_connected() || thread_id.is_empty() {
            return false;
        }
        let params = ThreadResumeParams {
            thread_id: thread_id.to_string(),
            ..ThreadResumeParams::default()
        };
        self.send_request(
            "thread/resume",
            to_params(&params),
            PendingContext::HistoryResume {
                thread_id: thread_id.to_string(),
            },
        )
        .is_some()
    }

    fn on_history_read(&mut self, thread_id: &str, outcome: Result<Value, RpcError>) {
        self.dirty = true;
        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                self.activity.push(ActivityEntry::system(
                    Some(thread_id.to_string()),
                    format!("Failed to load history: {}", error.message),
                ));
                return;
            }
        };
        let now = Utc::now();
        let thread = result.get("thread").unwrap_or(&result);
        if let Some(info) = thread_from_value(thread, now)
            && info.id == thread_id
        {
            self.upsert_thread(info);
        }
        let turns = thread
            .get("turns")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let entries = activity_from_turns(thread_id, turns, now);
        self.activity
            .retain(|entry| entry.thread_id.as_deref() != Some(thread_id));
        self.activity.extend(entries);
        self.current_thread_id = Some(thread_id.to_string());
    }

    pub fn list_directories(&mut self, cwd: Option<String>, reply: Reply<DirectoryListing>) {
        if !self.is_connected() {
            let _ = reply.send(Err(EngineError::NotConnected));
            return;
        }
        match cwd.map(|cwd| cwd.trim().to_string()).filter(|cwd| !cwd.is_empty()) {
            Some(cwd) => self.send_list_directories(cwd, reply),
            None => {
                let params = CommandExecParams {
                    command: vec!["pwd".to_string()],
                    timeout_ms: Some(self.command_timeout_ms()),
                    cwd: None,
                };
                self.send_request(
                    "command/exec",
                    to_params(&params),
                    PendingContext::ResolvePwd { reply },
                );
            }
        }
    }

    fn on_resolve_pwd(&mut self, reply: Reply<DirectoryListing>, outcome: Result<Value, RpcError>) {
        let stdout = match command_output(outcome) {
            Ok(stdout) => stdout,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        match stdout.lines().map(str::trim).find(|line| !line.is_empty()) {
            Some(cwd) => self.send_list_directories(cwd.to_string(), reply),
            None => {
                let _ = reply.send(Err(EngineError::Rejected(
                    "pwd returned no directory".to_string(),
                )));
            }
        }
    }

    fn send_list_directories(&mut self, cwd: String, reply: Reply<DirectoryListing>) {
        let params = CommandExecParams {
            command: ["find", cwd.as_str(), "-mindepth", "1", "-maxdepth", "1", "-type", "d"]
                .iter()
                .map(|part| (*part).to_string())
                .collect(),
            timeout_ms: Some(self.command_timeout_ms()),
            cwd: Some(cwd.clone()),
        };
        self.send_request(
            "command/exec",
            to_params(&params),
            PendingContext::ListDirectories { cwd, reply },
        );
    }

    fn command_timeout_ms(&self) -> i64 {
        i64::try_from(self.settings.command_timeout.as_millis()).unwrap_or(i64::MAX)
    }

    pub fn create_thread(&mut self, cwd: Option<String>, reply: Reply<String>) {
        if !self.is_connected() {
            let _ = reply.send(Err(EngineError::NotConnected));
            return;
        }
        let params = ThreadStartParams {
            model: None,
            cwd: cwd.filter(|cwd| !cwd.trim().is_empty()),
        };
        self.send_request(
            "thread/start",
            to_params(&params),
            PendingContext::CreateThread { reply },
        );
    }

    fn on_create_thread(&mut self, reply: Reply<String>, outcome: Result<Value, RpcError>) {
        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                let _ = reply.send(Err(EngineError::Rejected(error.message)));
                return;
            }
        };
        let thread = result.get("thread").unwrap_or(&result);
        match thread_from_value(thread, Utc::now()) {
            Some(info) => {
                let id = info.id.clone();
                self.upsert_thread(info);
                self.dirty = true;
                let _ = reply.send(Ok(id));
            }
            None => {
                let _ = reply.send(Err(EngineError::Rejected(
                    "thread/start response carried no thread id".to_string(),
                )));
            }
        }
    }

    pub fn archive_thread(&mut self, thread_id: &str, reply: Reply<()>) {
        if !self.is_connected() {
            let _ = reply.send(Err(EngineError::NotConnected));
            return;
        }
        let params = ThreadArchiveParams {
            thread_id: thread_id.to_string(),
        };
        self.send_request(
            "thread/archive",
            to_params(&params),
            PendingContext::ArchiveThread {
                thread_id: thread_id.to_string(),
                reply,
            },
        );
    }

    pub fn select_thread(&mut self, thread_id: Option<String>) {
        if self.current_thread_id != thread_id {
            self.current_thread_id = thread_id;
            self.dirty = true;
        }
    }

    // Notifications

    fn handle_notification(&mut self, method: &str, params: &Value) {
        match normalize_notification(method, params) {
            Some(event) => self.apply_event(event),
            None => debug!(method, "ignoring notification"),
        }
    }

    fn apply_event(&mut self, normalized: NormalizedEvent) {
        let NormalizedEvent { ids, event } = normalized;
        let correlated = self.correlator.resolve_thread(&ids, None);
        let thread_id = correlated
            .clone()
            .or_else(|| self.current_thread_id.clone());
        self.correlator.observe(&ids, thread_id.as_deref());
        let turn_id = ids.turn_id.clone().or_else(|| {
            ids.item_id
                .as_deref()
                .and_then(|item| self.correlator.turn_for_item(item))
                .map(str::to_string)
        });
        let now = Utc::now();
        self.dirty = true;

        match event {
            ServerEvent::ThreadStarted { thread } => {
                if let Some(info) = thread_from_value(&thread, now) {
                    self.upsert_thread(info);
                }
            }
            ServerEvent::ThreadArchived => {
                // Only an explicit id may remove a thread.
                if let Some(thread_id) = ids.thread_id.as_deref() {
                    self.remove_thread(thread_id);
                }
            }
            ServerEvent::ThreadNameUpdated { name } => {
                // Correlated ids only; the current thread is never assumed.
                if let (Some(thread_id), Some(name)) = (correlated.as_deref(), name)
                    && let Some(thread) = self.threads.get_mut(thread_id)
                {
                    let title = title_from_text(&name);
                    if !title.is_empty() {
                        thread.title = title;
                    }
                }
            }
            ServerEvent::TurnStarted => {
                let Some(turn_id) = turn_id else {
                    return;
                };
                self.touch_thread(thread_id.as_deref());
                let name = thread_id
                    .as_deref()
                    .and_then(|id| self.threads.get(id))
                    .map_or_else(|| "Turn".to_string(), |thread| thread.title.clone());
                self.tasks
                    .entry(turn_task_id(&turn_id))
                    .or_insert_with(|| RunningTask {
                        id: turn_task_id(&turn_id),
                        name,
                        kind: TaskKind::Turn,
                        thread_id: thread_id.clone(),
                        turn_id: Some(turn_id.clone()),
                        started_at: now,
                    });
            }
            ServerEvent::TurnCompleted { status, error } => {
                if let Some(turn_id) = turn_id.as_deref() {
                    self.tasks.remove(&turn_task_id(turn_id));
                    self.tasks
                        .retain(|_, task| task.turn_id.as_deref() != Some(turn_id));
                }
                self.touch_thread(thread_id.as_deref());
                if status.as_deref() == Some("failed") || error.is_some() {
                    let message = error.unwrap_or_else(|| "turn failed".to_string());
                    self.activity.push(ActivityEntry::system(
                        thread_id,
                        format!("Turn failed: {message}"),
                    ));
                }
            }
            ServerEvent::ItemStarted { item } => self.on_item_started(item, thread_id, turn_id),
            ServerEvent::ItemCompleted { item } => {
                if let Some(item_id) = item.id.as_deref() {
                    self.tasks.remove(item_id);
                    if item.kind == "agentMessage"
                        && let Some(text) = item.text()
                    {
                        self.streams.insert(item_id.to_string(), text);
                        self.update_assistant_entry(item_id, thread_id);
                    }
                    self.streams.remove(item_id);
                }
            }
            ServerEvent::AgentMessageDelta { delta } => {
                if let Some(item_id) = ids.item_id.as_deref() {
                    self.streams
                        .entry(item_id.to_string())
                        .or_default()
                        .push_str(&delta);
                    self.update_assistant_entry(item_id, thread_id);
                }
            }
            ServerEvent::Error {
                message,
                will_retry,
            } => {
                if will_retry {
                    debug!(error = %message, "transient server error");
                } else {
                    self.activity
                        .push(ActivityEntry::system(thread_id, format!("Error: {message}")));
                }
            }
        }
    }

    fn on_item_started(
        &mut self,
        item: ItemPayload,
        thread_id: Option<String>,
        turn_id: Option<String>,
    ) {
        let Some(item_id) = item.id.clone() else {
            return;
        };
        if let Some(kind) = TaskKind::from_item_type(&item.kind) {
            self.tasks.insert(
                item_id.clone(),
                RunningTask {
                    id: item_id.clone(),
                    name: task_name_for_item(&item.kind, &item.raw),
                    kind,
                    thread_id: thread_id.clone(),
                    turn_id,
                    started_at: Utc::now(),
                },
            );
        }
        if item.kind == "agentMessage"
            && let Some(text) = item.text().filter(|text| !text.is_empty())
        {
            self.streams.insert(item_id.clone(), text);
            self.update_assistant_entry(&item_id, thread_id);
        }
    }

    fn update_assistant_entry(&mut self, item_id: &str, thread_id: Option<String>) {
        let raw = self.streams.get(item_id).map(String::as_str).unwrap_or_default();
        let text = sanitize_assistant_text(raw);
        if let Some(entry) = self.activity.iter_mut().rev().find(|entry| {
            entry.kind == ActivityKind::Assistant && entry.item_id.as_deref() == Some(item_id)
        }) {
            entry.text = text;
            if entry.thread_id.is_none() {
                entry.thread_id = thread_id;
            }
            return;
        }
        if text.is_empty() {
            return;
        }
        self.activity.push(ActivityEntry {
            thread_id,
            timestamp: Utc::now(),
            kind: ActivityKind::Assistant,
            text,
            images: Vec::new(),
            item_id: Some(item_id.to_string()),
        });
    }

    // Thread set

    fn upsert_thread(&mut self, info: ThreadInfo) {
        match self.threads.get_mut(&info.id) {
            Some(existing) => merge_thread(existing, info),
            None => {
                self.threads.insert(info.id.clone(), info);
            }
        }
    }

    fn touch_thread(&mut self, thread_id: Option<&str>) {
        if let Some(thread) = thread_id.and_then(|id| self.threads.get_mut(id)) {
            thread.updated_at = thread.updated_at.max(Utc::now());
        }
    }

    /// Drop a thread and everything derived from it.
    fn remove_thread(&mut self, thread_id: &str) {
        self.threads.remove(thread_id);
        self.tasks
            .retain(|_, task| task.thread_id.as_deref() != Some(thread_id));
        let removed_items: Vec<String> = self
            .activity
            .iter()
            .filter(|entry| entry.thread_id.as_deref() == Some(thread_id))
            .filter_map(|entry| entry.item_id.clone())
            .collect();
        for item_id in removed_items {
            self.streams.remove(&item_id);
        }
        self.activity
            .retain(|entry| entry.thread_id.as_deref() != Some(thread_id));
        self.thread_list
            .scratch
            .retain(|thread| thread.id != thread_id);
        self.correlator.remove_thread(thread_id);
        if self.current_thread_id.as_deref() == Some(thread_id) {
            self.current_thread_id = None;
        }
        self.dirty = true;
        info!(thread_id, "thread removed");
    }

    fn send_request(&mut self, method: &str, params: Value, context: PendingContext) -> Option<i64> {
        match self.rpc.request(method, params, context) {
            Ok((id, text)) => {
                debug!(method, id, "queueing request");
                self.outbox.push(text);
                Some(id)
            }
            Err(error) => {
                warn!(method, error = %error, "failed to encode request");
                None
            }
        }
    }
}

fn turn_task_id(turn_id: &str) -> String {
    format!("turn:{turn_id}")
}

fn to_params<T: Serialize>(params: &T) -> Value {
    serde_json::to_value(params).unwrap_or_default()
}

fn data_array(result: &Value) -> Vec<Value> {
    if let Some(items) = result.as_array() {
        return items.clone();
    }
    ["data", "items", "models", "modes"]
        .iter()
        .find_map(|key| result.get(*key).and_then(Value::as_array))
        .cloned()
        .unwrap_or_default()
}

fn next_cursor(result: &Value) -> Option<String> {
    string_field(result, "nextCursor")
        .or_else(|| string_field(result, "next_cursor"))
        .filter(|cursor| !cursor.is_empty())
}

fn parse_thread_page(result: &Value) -> (Vec<ThreadEntry>, Option<String>) {
    let now = Utc::now();
    let items = result
        .as_array()
        .or_else(|| result.get("data").and_then(Value::as_array))
        .or_else(|| result.get("threads").and_then(Value::as_array))
        .or_else(|| result.get("threadIds").and_then(Value::as_array))
        .cloned()
        .unwrap_or_default();
    let entries = items
        .iter()
        .filter_map(|item| match item {
            Value::String(id) if !id.is_empty() => Some(ThreadEntry::Id(id.clone())),
            Value::Object(_) => thread_from_value(item, now).map(ThreadEntry::Full),
            _ => None,
        })
        .collect();
    (entries, next_cursor(result))
}

fn model_from_value(value: &Value) -> Option<ModelOption> {
    let id = string_field(value, "id").or_else(|| string_field(value, "model"))?;
    let model = string_field(value, "model").unwrap_or_else(|| id.clone());
    let effort = |value: &Value| -> Option<ReasoningEffort> {
        match value {
            Value::String(label) => ReasoningEffort::parse(label),
            other => string_field(other, "reasoningEffort")
                .or_else(|| string_field(other, "reasoning_effort"))
                .and_then(|label| ReasoningEffort::parse(&label)),
        }
    };
    Some(ModelOption {
        display_name: string_field(value, "displayName").unwrap_or_else(|| model.clone()),
        description: string_field(value, "description").unwrap_or_default(),
        default_effort: value.get("defaultReasoningEffort").and_then(effort),
        supported_efforts: value
            .get("supportedReasoningEfforts")
            .and_then(Value::as_array)
            .map(|efforts| efforts.iter().filter_map(effort).collect())
            .unwrap_or_default(),
        is_default: value
            .get("isDefault")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        id,
        model,
    })
}

fn collaboration_mode_from_value(value: &Value) -> Option<CollaborationModeOption> {
    let mode = string_field(value, "mode");
    let name = string_field(value, "name").or_else(|| mode.clone())?;
    let settings = value.get("settings").unwrap_or(value);
    Some(CollaborationModeOption {
        name,
        mode,
        model: string_field(settings, "model"),
        reasoning_effort: string_field(settings, "reasoning_effort")
            .or_else(|| string_field(settings, "reasoningEffort"))
            .and_then(|label| ReasoningEffort::parse(&label)),
    })
}

fn command_output(outcome: Result<Value, RpcError>) -> EngineResult<String> {
    let result = outcome.map_err(|error| EngineError::Rejected(error.message))?;
    let response: CommandExecResponse = serde_json::from_value(result)
        .map_err(|error| EngineError::Rejected(format!("malformed command/exec response: {error}")))?;
    if response.exit_code != 0 {
        return Err(EngineError::CommandFailed {
            exit_code: response.exit_code,
            stderr: response.stderr.trim().to_string(),
        });
    }
    Ok(response.stdout)
}

/// Absolute, de-duplicated, sorted directory paths from `find` output.
pub fn normalize_directories(cwd: &str, stdout: &str) -> Vec<String> {
    let base = cwd.trim_end_matches('/');
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "." && *line != "./")
        .map(|line| {
            let line = if line.len() > 1 {
                line.trim_end_matches('/')
            } else {
                line
            };
            if line.starts_with('/') {
                line.to_string()
            } else {
                format!("{base}/{}", line.trim_start_matches("./"))
            }
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
