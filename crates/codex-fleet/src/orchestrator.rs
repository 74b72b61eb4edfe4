//! Fleet of connection engines and the merged view across them.
//!
//! Raw thread ids are only unique per server, so everything in the merged
//! view is keyed by `<connection id>::<raw id>`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::{EndpointColor, EndpointConfig};
use crate::engine::{ConnectionEngine, EngineUpdate, StreamConnector, TcpConnector};
use crate::error::{EngineError, EngineResult};
use crate::model::{
    CollaborationModeOption, ConnectionState, DirectoryListing, EngineSnapshot, ModelOption,
    RunningTask, SocketPhase, TaskRequest, ThreadInfo,
};
use crate::settings::EngineSettings;

const MERGED_ID_SEPARATOR: &str = "::";
const UNKNOWN_THREAD_TITLE: &str = "Unknown thread";

pub fn merged_id(connection_id: &str, raw_id: &str) -> String {
    format!("{connection_id}{MERGED_ID_SEPARATOR}{raw_id}")
}

/// Split a merged id into connection id and raw id.
pub fn split_merged_id(merged: &str) -> Option<(&str, &str)> {
    merged
        .split_once(MERGED_ID_SEPARATOR)
        .filter(|(connection_id, raw_id)| !connection_id.is_empty() && !raw_id.is_empty())
}

/// What the orchestrator needs from an engine.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    fn connect(&self, url: &str);
    fn disconnect(&self);
    fn start_task(&self, request: TaskRequest) -> bool;
    fn load_thread_history(&self, thread_id: &str);
    fn refresh_thread_list(&self);
    fn select_thread(&self, thread_id: Option<String>);
    async fn list_directories(&self, cwd: Option<String>) -> EngineResult<DirectoryListing>;
    async fn create_thread(&self, cwd: Option<String>) -> EngineResult<String>;
    async fn archive_thread(&self, thread_id: &str) -> EngineResult<()>;
    /// Must not block on the engine's I/O.
    fn shutdown(&mut self);
}

#[async_trait]
impl EngineHandle for ConnectionEngine {
    fn connect(&self, url: &str) {
        ConnectionEngine::connect(self, url);
    }

    fn disconnect(&self) {
        ConnectionEngine::disconnect(self);
    }

    fn start_task(&self, request: TaskRequest) -> bool {
        ConnectionEngine::start_task(self, request)
    }

    fn load_thread_history(&self, thread_id: &str) {
        ConnectionEngine::load_thread_history(self, thread_id);
    }

    fn refresh_thread_list(&self) {
        ConnectionEngine::refresh_thread_list(self);
    }

    fn select_thread(&self, thread_id: Option<String>) {
        ConnectionEngine::select_thread(self, thread_id);
    }

    async fn list_directories(&self, cwd: Option<String>) -> EngineResult<DirectoryListing> {
        ConnectionEngine::list_directories(self, cwd).await
    }

    async fn create_thread(&self, cwd: Option<String>) -> EngineResult<String> {
        ConnectionEngine::create_thread(self, cwd).await
    }

    async fn archive_thread(&self, thread_id: &str) -> EngineResult<()> {
        ConnectionEngine::archive_thread(self, thread_id).await
    }

    fn shutdown(&mut self) {
        ConnectionEngine::shutdown(self);
    }
}

/// Creates engines for the orchestrator.
pub trait EngineSpawner: Send {
    fn spawn(
        &mut self,
        connection_id: &str,
        instance: u64,
        update_tx: mpsc::UnboundedSender<EngineUpdate>,
    ) -> Box<dyn EngineHandle>;
}

/// Spawns one [`ConnectionEngine`] thread per connection.
pub struct ThreadEngineSpawner {
    settings: EngineSettings,
    connector: Arc<dyn StreamConnector>,
}

impl ThreadEngineSpawner {
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_connector(settings, Arc::new(TcpConnector))
    }

    pub fn with_connector(settings: EngineSettings, connector: Arc<dyn StreamConnector>) -> Self {
        Self {
            settings,
            connector,
        }
    }
}

impl EngineSpawner for ThreadEngineSpawner {
    fn spawn(
        &mut self,
        connection_id: &str,
        instance: u64,
        update_tx: mpsc::UnboundedSender<EngineUpdate>,
    ) -> Box<dyn EngineHandle> {
        Box::new(ConnectionEngine::spawn_with_connector(
            connection_id,
            instance,
            self.settings.clone(),
            Arc::clone(&self.connector),
            update_tx,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connection_id: String,
    pub name: String,
    pub color: EndpointColor,
    pub enabled: bool,
    pub url: String,
    pub state: ConnectionState,
    pub phase: SocketPhase,
    pub last_error: Option<String>,
    pub thread_count: usize,
    pub task_count: usize,
    pub submitted_task_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedThread {
    pub merged_id: String,
    pub connection_id: String,
    pub connection_name: String,
    pub color: EndpointColor,
    pub thread: ThreadInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedTask {
    pub merged_id: String,
    pub connection_id: String,
    pub connection_name: String,
    pub color: EndpointColor,
    pub task: RunningTask,
    pub thread_merged_id: Option<String>,
    pub thread_title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetCounts {
    pub connections: usize,
    pub enabled: usize,
    pub connected: usize,
    pub failed: usize,
    pub threads: usize,
    pub running_tasks: usize,
    pub submitted_tasks: u64,
}

/// Derived state across every configured connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetView {
    /// In configuration order.
    pub statuses: Vec<ConnectionStatus>,
    /// Descending update time.
    pub threads: Vec<MergedThread>,
    /// Descending start time.
    pub tasks: Vec<MergedTask>,
    pub counts: FleetCounts,
}

impl FleetView {
    pub fn thread(&self, merged_id: &str) -> Option<&MergedThread> {
        self.threads.iter().find(|thread| thread.merged_id == merged_id)
    }

    pub fn status(&self, connection_id: &str) -> Option<&ConnectionStatus> {
        self.statuses
            .iter()
            .find(|status| status.connection_id == connection_id)
    }
}

struct Slot {
    handle: Box<dyn EngineHandle>,
    url: String,
    instance: u64,
    snapshot: EngineSnapshot,
}

pub struct ConnectionOrchestrator {
    spawner: Box<dyn EngineSpawner>,
    configs: Vec<EndpointConfig>,
    slots: HashMap<String, Slot>,
    next_instance: u64,
    update_tx: mpsc::UnboundedSender<EngineUpdate>,
    update_rx: mpsc::UnboundedReceiver<EngineUpdate>,
    view_tx: watch::Sender<FleetView>,
    view: FleetView,
    dirty: bool,
}

impl ConnectionOrchestrator {
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_spawner(Box::new(ThreadEngineSpawner::new(settings)))
    }

    pub fn with_spawner(spawner: Box<dyn EngineSpawner>) -> Self {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (view_tx, _) = watch::channel(FleetView::default());
        Self {
            spawner,
            configs: Vec::new(),
            slots: HashMap::new(),
            next_instance: 1,
            update_tx,
            update_rx,
            view_tx,
            view: FleetView::default(),
            dirty: false,
        }
    }

    /// Bring the engine set in line with `configs`: one live engine per
    /// enabled endpoint, reconnected when its URL changed.
    pub fn reconcile(&mut self, configs: &[EndpointConfig]) {
        self.configs = configs.to_vec();

        let stale: Vec<String> = self
            .slots
            .keys()
            .filter(|id| {
                !configs
                    .iter()
                    .any(|config| config.enabled && &config.id == *id)
            })
            .cloned()
            .collect();
        for connection_id in stale {
            if let Some(mut slot) = self.slots.remove(&connection_id) {
                info!(connection_id = %connection_id, "stopping engine");
                slot.handle.shutdown();
            }
        }

        for config in configs.iter().filter(|config| config.enabled) {
            let url = config.url();
            match self.slots.get_mut(&config.id) {
                Some(slot) if slot.url == url => {}
                Some(slot) => {
                    info!(connection_id = %config.id, url = %url, "endpoint changed, reconnecting");
                    slot.url.clone_from(&url);
                    slot.snapshot = EngineSnapshot::default();
                    slot.handle.connect(&url);
                }
                None => {
                    let instance = self.next_instance;
                    self.next_instance += 1;
                    info!(connection_id = %config.id, instance, url = %url, "starting engine");
                    let handle = self
                        .spawner
                        .spawn(&config.id, instance, self.update_tx.clone());
                    handle.connect(&url);
                    self.slots.insert(
                        config.id.clone(),
                        Slot {
                            handle,
                            url,
                            instance,
                            snapshot: EngineSnapshot::default(),
                        },
                    );
                }
            }
        }

        self.dirty = true;
        self.recompute_derived_state();
    }

    /// Apply every queued engine update, then recompute once.
    /// Returns whether the view changed.
    pub fn pump(&mut self) -> bool {
        while let Ok(update) = self.update_rx.try_recv() {
            self.apply_update(update);
        }
        if self.dirty {
            self.recompute_derived_state()
        } else {
            false
        }
    }

    /// Wait for at least one engine update, then behave like [`Self::pump`].
    pub async fn next_update(&mut self) -> bool {
        if let Some(update) = self.update_rx.recv().await {
            self.apply_update(update);
        }
        self.pump()
    }

    fn apply_update(&mut self, update: EngineUpdate) {
        match self.slots.get_mut(&update.connection_id) {
            Some(slot) if slot.instance == update.instance => {
                slot.snapshot = *update.snapshot;
                self.dirty = true;
            }
            _ => debug!(
                connection_id = %update.connection_id,
                instance = update.instance,
                "dropping update from retired engine"
            ),
        }
    }

    /// Rebuild the merged view. Publishes and returns true only on change.
    pub fn recompute_derived_state(&mut self) -> bool {
        self.dirty = false;
        let view = self.build_view();
        if view == self.view {
            return false;
        }
        self.view = view;
        self.view_tx.send_replace(self.view.clone());
        true
    }

    fn build_view(&self) -> FleetView {
        let mut view = FleetView::default();
        let empty = EngineSnapshot::default();

        for config in &self.configs {
            let slot = self.slots.get(&config.id).filter(|_| config.enabled);
            let snapshot = slot.map_or(&empty, |slot| &slot.snapshot);

            view.statuses.push(ConnectionStatus {
                connection_id: config.id.clone(),
                name: config.name.clone(),
                color: config.color,
                enabled: config.enabled,
                url: config.url(),
                state: snapshot.state,
                phase: snapshot.phase,
                last_error: snapshot.last_error.clone(),
                thread_count: snapshot.threads.len(),
                task_count: snapshot.tasks.len(),
                submitted_task_count: snapshot.submitted_task_count,
            });
            view.counts.connections += 1;
            if config.enabled {
                view.counts.enabled += 1;
            }
            match snapshot.state {
                ConnectionState::Connected => view.counts.connected += 1,
                ConnectionState::Failed => view.counts.failed += 1,
                ConnectionState::Connecting | ConnectionState::Disconnected => {}
            }
            view.counts.submitted_tasks += snapshot.submitted_task_count;

            if slot.is_none() {
                continue;
            }
            for thread in &snapshot.threads {
                view.threads.push(MergedThread {
                    merged_id: merged_id(&config.id, &thread.id),
                    connection_id: config.id.clone(),
                    connection_name: config.name.clone(),
                    color: config.color,
                    thread: thread.clone(),
                });
            }
            for task in &snapshot.tasks {
                let thread = task
                    .thread_id
                    .as_deref()
                    .and_then(|thread_id| snapshot.thread(thread_id));
                view.tasks.push(MergedTask {
                    merged_id: merged_id(&config.id, &task.id),
                    connection_id: config.id.clone(),
                    connection_name: config.name.clone(),
                    color: config.color,
                    task: task.clone(),
                    thread_merged_id: task
                        .thread_id
                        .as_deref()
                        .map(|thread_id| merged_id(&config.id, thread_id)),
                    thread_title: thread.map_or_else(
                        || UNKNOWN_THREAD_TITLE.to_string(),
                        |thread| thread.title.clone(),
                    ),
                });
            }
        }

        view.threads.sort_by(|left, right| {
            right
                .thread
                .updated_at
                .cmp(&left.thread.updated_at)
                .then_with(|| left.merged_id.cmp(&right.merged_id))
        });
        view.tasks.sort_by(|left, right| {
            right
                .task
                .started_at
                .cmp(&left.task.started_at)
                .then_with(|| left.merged_id.cmp(&right.merged_id))
        });
        view.counts.threads = view.threads.len();
        view.counts.running_tasks = view.tasks.len();
        view
    }

    pub fn subscribe(&self) -> watch::Receiver<FleetView> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> &FleetView {
        &self.view
    }

    pub fn configs(&self) -> &[EndpointConfig] {
        &self.configs
    }

    /// Number of engines currently alive.
    pub fn engine_count(&self) -> usize {
        self.slots.len()
    }

    pub fn snapshot(&self, connection_id: &str) -> Option<&EngineSnapshot> {
        self.slots.get(connection_id).map(|slot| &slot.snapshot)
    }

    pub fn models(&self, connection_id: &str) -> Vec<ModelOption> {
        self.snapshot(connection_id)
            .map(|snapshot| snapshot.models.clone())
            .unwrap_or_default()
    }

    pub fn collaboration_modes(&self, connection_id: &str) -> Vec<CollaborationModeOption> {
        self.snapshot(connection_id)
            .map(|snapshot| snapshot.collaboration_modes.clone())
            .unwrap_or_default()
    }

    fn handle(&self, connection_id: &str) -> EngineResult<&dyn EngineHandle> {
        self.slots
            .get(connection_id)
            .map(|slot| slot.handle.as_ref())
            .ok_or_else(|| EngineError::UnknownConnection(connection_id.to_string()))
    }

    fn resolve_merged<'a>(&self, merged: &'a str) -> EngineResult<(&dyn EngineHandle, &'a str)> {
        let (connection_id, raw_id) = split_merged_id(merged)
            .ok_or_else(|| EngineError::InvalidArgument(format!("not a merged id: {merged}")))?;
        Ok((self.handle(connection_id)?, raw_id))
    }

    /// Submit a prompt on one connection. `request.thread_id` may be raw or
    /// merged. `Ok(false)` means the engine declined without sending.
    pub fn start_task(&self, connection_id: &str, mut request: TaskRequest) -> EngineResult<bool> {
        let handle = self.handle(connection_id)?;
        if let Some(thread_id) = request.thread_id.take() {
            let raw = match split_merged_id(&thread_id) {
                Some((owner, raw)) if owner == connection_id => raw.to_string(),
                Some(_) => {
                    return Err(EngineError::InvalidArgument(format!(
                        "thread {thread_id} belongs to another connection"
                    )));
                }
                None => thread_id,
            };
            request.thread_id = Some(raw);
        }
        Ok(handle.start_task(request))
    }

    pub fn load_thread_history(&self, merged_thread_id: &str) -> EngineResult<()> {
        let (handle, thread_id) = self.resolve_merged(merged_thread_id)?;
        handle.load_thread_history(thread_id);
        Ok(())
    }

    pub fn select_thread(&self, merged_thread_id: &str) -> EngineResult<()> {
        let (handle, thread_id) = self.resolve_merged(merged_thread_id)?;
        handle.select_thread(Some(thread_id.to_string()));
        Ok(())
    }

    pub fn refresh_thread_list(&self, connection_id: &str) -> EngineResult<()> {
        self.handle(connection_id)?.refresh_thread_list();
        Ok(())
    }

    pub fn disconnect(&self, connection_id: &str) -> EngineResult<()> {
        self.handle(connection_id)?.disconnect();
        Ok(())
    }

    pub async fn list_directories(
        &self,
        connection_id: &str,
        cwd: Option<String>,
    ) -> EngineResult<DirectoryListing> {
        self.handle(connection_id)?.list_directories(cwd).await
    }

    /// Returns the merged id of the new thread.
    pub async fn create_thread(
        &self,
        connection_id: &str,
        cwd: Option<String>,
    ) -> EngineResult<String> {
        let thread_id = self.handle(connection_id)?.create_thread(cwd).await?;
        Ok(merged_id(connection_id, &thread_id))
    }

    pub async fn archive_thread(&self, merged_thread_id: &str) -> EngineResult<()> {
        let (handle, thread_id) = self.resolve_merged(merged_thread_id)?;
        handle.archive_thread(thread_id).await
    }

    /// Stop every engine without waiting on them.
    pub fn shutdown(&mut self) {
        for (connection_id, mut slot) in self.slots.drain() {
            debug!(connection_id = %connection_id, "stopping engine");
            slot.handle.shutdown();
        }
        self.configs.clear();
        self.recompute_derived_state();
    }
}

#[cfg(test)]
mod tests;
