use super::*;
use std::sync::Mutex;

use chrono::{TimeZone, Utc};

use crate::model::TaskKind;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Connect(String),
    StartTask(Option<String>),
    LoadHistory(String),
    Archive(String),
    Shutdown,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<(String, u64, Call)>>,
    senders: Mutex<Vec<(String, u64, mpsc::UnboundedSender<EngineUpdate>)>>,
}

impl Shared {
    fn calls_for(&self, connection_id: &str) -> Vec<Call> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .filter(|(id, _, _)| id == connection_id)
            .map(|(_, _, call)| call.clone())
            .collect()
    }

    fn push(&self, connection_id: &str, instance: u64, snapshot: EngineSnapshot) {
        let senders = self.senders.lock().expect("senders");
        let (_, _, sender) = senders
            .iter()
            .find(|(id, known, _)| id == connection_id && *known == instance)
            .expect("engine spawned");
        sender
            .send(EngineUpdate {
                connection_id: connection_id.to_string(),
                instance,
                snapshot: Box::new(snapshot),
            })
            .expect("send update");
    }
}

struct FakeEngine {
    connection_id: String,
    instance: u64,
    shared: Arc<Shared>,
}

impl FakeEngine {
    fn record(&self, call: Call) {
        self.shared
            .calls
            .lock()
            .expect("calls")
            .push((self.connection_id.clone(), self.instance, call));
    }
}

#[async_trait]
impl EngineHandle for FakeEngine {
    fn connect(&self, url: &str) {
        self.record(Call::Connect(url.to_string()));
    }

    fn disconnect(&self) {}

    fn start_task(&self, request: TaskRequest) -> bool {
        self.record(Call::StartTask(request.thread_id));
        true
    }

    fn load_thread_history(&self, thread_id: &str) {
        self.record(Call::LoadHistory(thread_id.to_string()));
    }

    fn refresh_thread_list(&self) {}

    fn select_thread(&self, _thread_id: Option<String>) {}

    async fn list_directories(&self, cwd: Option<String>) -> EngineResult<DirectoryListing> {
        Ok(DirectoryListing {
            cwd: cwd.unwrap_or_else(|| "/".to_string()),
            directories: Vec::new(),
        })
    }

    async fn create_thread(&self, _cwd: Option<String>) -> EngineResult<String> {
        Ok("created".to_string())
    }

    async fn archive_thread(&self, thread_id: &str) -> EngineResult<()> {
        self.record(Call::Archive(thread_id.to_string()));
        Ok(())
    }

    fn shutdown(&mut self) {
        self.record(Call::Shutdown);
    }
}

struct FakeSpawner {
    shared: Arc<Shared>,
}

impl EngineSpawner for FakeSpawner {
    fn spawn(
        &mut self,
        connection_id: &str,
        instance: u64,
        update_tx: mpsc::UnboundedSender<EngineUpdate>,
    ) -> Box<dyn EngineHandle> {
        self.shared
            .senders
            .lock()
            .expect("senders")
            .push((connection_id.to_string(), instance, update_tx));
        Box::new(FakeEngine {
            connection_id: connection_id.to_string(),
            instance,
            shared: Arc::clone(&self.shared),
        })
    }
}

fn orchestrator() -> (ConnectionOrchestrator, Arc<Shared>) {
    let shared = Arc::new(Shared::default());
    let spawner = FakeSpawner {
        shared: Arc::clone(&shared),
    };
    (ConnectionOrchestrator::with_spawner(Box::new(spawner)), shared)
}

fn endpoint(id: &str, name: &str, port: u16) -> EndpointConfig {
    EndpointConfig {
        id: id.to_string(),
        ..EndpointConfig::new(name, "127.0.0.1", port)
    }
}

fn thread(id: &str, title: &str, secs: i64) -> ThreadInfo {
    ThreadInfo {
        id: id.to_string(),
        cwd: None,
        title: title.to_string(),
        updated_at: Utc.timestamp_opt(secs, 0).single().expect("timestamp"),
        placeholder: false,
    }
}

fn task(id: &str, thread_id: Option<&str>, secs: i64) -> RunningTask {
    RunningTask {
        id: id.to_string(),
        name: id.to_string(),
        kind: TaskKind::Turn,
        thread_id: thread_id.map(str::to_string),
        turn_id: None,
        started_at: Utc.timestamp_opt(secs, 0).single().expect("timestamp"),
    }
}

fn connected(threads: Vec<ThreadInfo>, tasks: Vec<RunningTask>) -> EngineSnapshot {
    EngineSnapshot {
        state: ConnectionState::Connected,
        phase: SocketPhase::Open,
        threads,
        tasks,
        ..EngineSnapshot::default()
    }
}

#[test]
fn reconcile_spawns_enabled_endpoints_only() {
    let (mut fleet, shared) = orchestrator();
    let mut disabled = endpoint("b", "Beta", 4501);
    disabled.enabled = false;
    fleet.reconcile(&[endpoint("a", "Alpha", 4500), disabled]);

    assert_eq!(fleet.engine_count(), 1);
    assert_eq!(
        shared.calls_for("a"),
        vec![Call::Connect("ws://127.0.0.1:4500".to_string())]
    );
    assert!(shared.calls_for("b").is_empty());

    let view = fleet.view();
    assert_eq!(view.statuses.len(), 2);
    assert_eq!(view.counts.connections, 2);
    assert_eq!(view.counts.enabled, 1);
    assert!(!view.status("b").expect("status").enabled);
}

#[test]
fn disable_enable_cycles_keep_one_engine() {
    let (mut fleet, shared) = orchestrator();
    let mut config = endpoint("a", "Alpha", 4500);
    for _ in 0..3 {
        config.enabled = false;
        fleet.reconcile(&[config.clone()]);
        assert_eq!(fleet.engine_count(), 0);
        config.enabled = true;
        fleet.reconcile(&[config.clone()]);
        assert_eq!(fleet.engine_count(), 1);
    }
    let calls = shared.calls_for("a");
    let connects = calls.iter().filter(|call| matches!(call, Call::Connect(_))).count();
    let shutdowns = calls.iter().filter(|call| **call == Call::Shutdown).count();
    assert_eq!(connects, 3);
    assert_eq!(shutdowns, 2);

    // Updates from a retired instance are ignored.
    shared.push("a", 1, connected(vec![thread("old", "Old", 10)], Vec::new()));
    fleet.pump();
    assert!(fleet.view().threads.is_empty());

    shared.push("a", 3, connected(vec![thread("new", "New", 10)], Vec::new()));
    assert!(fleet.pump());
    assert_eq!(fleet.view().threads.len(), 1);
}

#[test]
fn url_change_reconnects_same_engine() {
    let (mut fleet, shared) = orchestrator();
    let mut config = endpoint("a", "Alpha", 4500);
    fleet.reconcile(&[config.clone()]);
    fleet.reconcile(&[config.clone()]);
    config.port = 4600;
    fleet.reconcile(&[config]);

    assert_eq!(fleet.engine_count(), 1);
    assert_eq!(
        shared.calls_for("a"),
        vec![
            Call::Connect("ws://127.0.0.1:4500".to_string()),
            Call::Connect("ws://127.0.0.1:4600".to_string()),
        ]
    );
}

#[test]
fn identical_raw_ids_stay_distinct_in_merged_view() {
    let (mut fleet, shared) = orchestrator();
    fleet.reconcile(&[endpoint("a", "Alpha", 4500), endpoint("b", "Beta", 4501)]);

    shared.push(
        "a",
        1,
        connected(
            vec![thread("t1", "Alpha work", 100)],
            vec![task("turn:x", Some("t1"), 50)],
        ),
    );
    shared.push(
        "b",
        2,
        connected(
            vec![thread("t1", "Beta work", 200)],
            vec![task("turn:y", Some("gone"), 60)],
        ),
    );
    assert!(fleet.pump());

    let view = fleet.view();
    let ids: Vec<&str> = view.threads.iter().map(|t| t.merged_id.as_str()).collect();
    assert_eq!(ids, vec!["b::t1", "a::t1"]);
    assert_eq!(view.thread("a::t1").map(|t| t.connection_name.as_str()), Some("Alpha"));

    assert_eq!(view.tasks.len(), 2);
    assert_eq!(view.tasks[0].merged_id, "b::turn:y");
    assert_eq!(view.tasks[0].thread_title, "Unknown thread");
    assert_eq!(view.tasks[1].thread_title, "Alpha work");
    assert_eq!(view.tasks[1].thread_merged_id.as_deref(), Some("a::t1"));
    assert_eq!(view.counts.connected, 2);
    assert_eq!(view.counts.threads, 2);
}

#[test]
fn recompute_only_publishes_changes() {
    let (mut fleet, shared) = orchestrator();
    let mut watcher = fleet.subscribe();
    fleet.reconcile(&[endpoint("a", "Alpha", 4500)]);
    assert!(watcher.has_changed().expect("watch"));
    watcher.borrow_and_update();

    assert!(!fleet.recompute_derived_state());
    assert!(!fleet.pump());

    let snapshot = connected(vec![thread("t", "T", 1)], Vec::new());
    shared.push("a", 1, snapshot.clone());
    shared.push("a", 1, snapshot.clone());
    shared.push("a", 1, snapshot);
    assert!(fleet.pump());
    assert!(watcher.has_changed().expect("watch"));
    assert_eq!(watcher.borrow_and_update().threads.len(), 1);
    assert!(!fleet.pump());
}

#[test]
fn removed_connection_leaves_merged_view() {
    let (mut fleet, shared) = orchestrator();
    fleet.reconcile(&[endpoint("a", "Alpha", 4500)]);
    shared.push("a", 1, connected(vec![thread("t", "T", 1)], Vec::new()));
    fleet.pump();
    assert_eq!(fleet.view().threads.len(), 1);

    fleet.reconcile(&[]);
    assert!(fleet.view().threads.is_empty());
    assert!(fleet.view().statuses.is_empty());
    assert_eq!(shared.calls_for("a").last(), Some(&Call::Shutdown));
}

#[test]
fn commands_route_by_merged_id() {
    let (mut fleet, shared) = orchestrator();
    fleet.reconcile(&[endpoint("a", "Alpha", 4500), endpoint("b", "Beta", 4501)]);

    let request = TaskRequest {
        thread_id: Some("a::t1".to_string()),
        ..TaskRequest::new("go")
    };
    assert_eq!(fleet.start_task("a", request), Ok(true));
    let raw = TaskRequest {
        thread_id: Some("t2".to_string()),
        ..TaskRequest::new("go")
    };
    assert_eq!(fleet.start_task("a", raw), Ok(true));
    let foreign = TaskRequest {
        thread_id: Some("b::t1".to_string()),
        ..TaskRequest::new("go")
    };
    assert!(matches!(
        fleet.start_task("a", foreign),
        Err(EngineError::InvalidArgument(_))
    ));
    assert_eq!(
        fleet.start_task("zzz", TaskRequest::new("go")),
        Err(EngineError::UnknownConnection("zzz".to_string()))
    );

    fleet.load_thread_history("b::t9").expect("history");
    assert!(matches!(
        fleet.load_thread_history("no-separator"),
        Err(EngineError::InvalidArgument(_))
    ));

    assert_eq!(
        shared.calls_for("a")[1..],
        [
            Call::StartTask(Some("t1".to_string())),
            Call::StartTask(Some("t2".to_string())),
        ]
    );
    assert_eq!(shared.calls_for("b")[1], Call::LoadHistory("t9".to_string()));
}

#[tokio::test]
async fn async_commands_resolve_through_engines() {
    let (mut fleet, shared) = orchestrator();
    fleet.reconcile(&[endpoint("a", "Alpha", 4500)]);

    assert_eq!(fleet.create_thread("a", None).await, Ok("a::created".to_string()));
    fleet.archive_thread("a::t1").await.expect("archive");
    assert_eq!(shared.calls_for("a").last(), Some(&Call::Archive("t1".to_string())));
    let listing = fleet
        .list_directories("a", Some("/srv".to_string()))
        .await
        .expect("listing");
    assert_eq!(listing.cwd, "/srv");
    assert!(matches!(
        fleet.archive_thread("b::t1").await,
        Err(EngineError::UnknownConnection(_))
    ));
}

#[test]
fn merged_ids_split_at_first_separator() {
    assert_eq!(split_merged_id("conn::raw::tail"), Some(("conn", "raw::tail")));
    assert_eq!(split_merged_id("::raw"), None);
    assert_eq!(split_merged_id("conn::"), None);
    assert_eq!(merged_id("c", "r"), "c::r");
}
