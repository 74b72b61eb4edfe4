//! Multi-connection monitor for Codex app-servers.
//!
//! Each configured endpoint gets its own [`ConnectionEngine`]; the
//! [`ConnectionOrchestrator`] keeps the engine set in line with the endpoint
//! store and folds every engine's snapshot into one [`FleetView`].

pub mod config;
pub mod correlator;
pub mod engine;
pub mod error;
pub mod history;
pub mod model;
pub mod orchestrator;
pub mod settings;

pub use config::{EndpointColor, EndpointConfig, EndpointStore, default_endpoints_path};
pub use engine::{ConnectionEngine, EngineUpdate, StreamConnector, TcpConnector};
pub use error::{EngineError, EngineResult};
pub use model::{
    ActivityEntry, ActivityKind, CollaborationModeOption, ConnectionState, DirectoryListing,
    EngineSnapshot, ModelOption, RunningTask, SocketPhase, TaskKind, TaskRequest, ThreadInfo,
};
pub use orchestrator::{
    ConnectionOrchestrator, ConnectionStatus, EngineHandle, EngineSpawner, FleetCounts, FleetView,
    MergedTask, MergedThread, ThreadEngineSpawner, merged_id, split_merged_id,
};
pub use settings::EngineSettings;
