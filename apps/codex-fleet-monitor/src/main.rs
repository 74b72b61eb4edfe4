use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use codex_fleet::{
    ConnectionOrchestrator, ConnectionState, EndpointColor, EndpointConfig, EndpointStore,
    EngineSettings, FleetView, TaskRequest,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "codex-fleet-monitor", about = "Watch threads and running tasks across Codex app-servers")]
struct Args {
    /// Endpoint store to load instead of the default location.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Extra app-server URL to watch; repeatable.
    #[arg(long = "connect", value_name = "URL")]
    connect: Vec<String>,

    /// Persist `--connect` endpoints into the store.
    #[arg(long, requires = "connect")]
    save: bool,

    /// Submit this prompt on the first connected endpoint.
    #[arg(long)]
    prompt: Option<String>,

    /// Working directory for `--prompt` and `--list-dirs`.
    #[arg(long)]
    cwd: Option<String>,

    #[arg(long)]
    model: Option<String>,

    /// List directories under `--cwd` on the first connected endpoint.
    #[arg(long)]
    list_dirs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut store = match &args.store {
        Some(path) => EndpointStore::load(path),
        None => EndpointStore::load_default(),
    };

    let mut endpoints = store.endpoints().to_vec();
    for (index, url) in args.connect.iter().enumerate() {
        let mut endpoint = EndpointConfig::from_url(format!("Ad hoc {}", index + 1), url)
            .with_context(|| format!("invalid --connect url {url}"))?;
        endpoint.color = EndpointColor::for_index(endpoints.len());
        if args.save {
            store
                .add(endpoint.clone())
                .with_context(|| format!("save endpoint {url}"))?;
        }
        endpoints.push(endpoint);
    }
    if endpoints.is_empty() {
        bail!(
            "no endpoints in {}; pass --connect <url>",
            store.path().display()
        );
    }
    info!(
        store = %store.path().display(),
        endpoints = endpoints.len(),
        "starting fleet monitor"
    );

    let mut fleet = ConnectionOrchestrator::new(EngineSettings::default());
    fleet.reconcile(&endpoints);
    log_view(fleet.view());

    let mut action_pending = args.prompt.is_some() || args.list_dirs;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(error) = result {
                    warn!(error = %error, "ctrl-c handler failed");
                }
                break;
            }
            changed = fleet.next_update() => {
                if !changed {
                    continue;
                }
                log_view(fleet.view());
                if action_pending && let Some(connection_id) = first_connected(fleet.view()) {
                    action_pending = false;
                    run_action(&fleet, &connection_id, &args).await;
                }
            }
        }
    }

    info!("shutting down");
    fleet.shutdown();
    Ok(())
}

fn first_connected(view: &FleetView) -> Option<String> {
    view.statuses
        .iter()
        .find(|status| status.state == ConnectionState::Connected)
        .map(|status| status.connection_id.clone())
}

async fn run_action(fleet: &ConnectionOrchestrator, connection_id: &str, args: &Args) {
    if args.list_dirs {
        match fleet.list_directories(connection_id, args.cwd.clone()).await {
            Ok(listing) => {
                info!(connection_id, cwd = %listing.cwd, count = listing.directories.len(), "directories");
                for directory in &listing.directories {
                    info!(connection_id, directory = %directory, "directory");
                }
            }
            Err(error) => warn!(connection_id, error = %error, "directory listing failed"),
        }
    }

    if let Some(prompt) = &args.prompt {
        let request = TaskRequest {
            cwd: args.cwd.clone(),
            model: args.model.clone(),
            ..TaskRequest::new(prompt.clone())
        };
        match fleet.start_task(connection_id, request) {
            Ok(true) => info!(connection_id, "prompt submitted"),
            Ok(false) => warn!(connection_id, "prompt not accepted"),
            Err(error) => warn!(connection_id, error = %error, "prompt failed"),
        }
    }
}

fn log_view(view: &FleetView) {
    let counts = &view.counts;
    info!(
        connections = counts.connections,
        connected = counts.connected,
        failed = counts.failed,
        threads = counts.threads,
        running_tasks = counts.running_tasks,
        submitted = counts.submitted_tasks,
        "fleet"
    );
    for status in &view.statuses {
        info!(
            connection_id = %status.connection_id,
            name = %status.name,
            color = status.color.label(),
            state = status.state.label(),
            phase = status.phase.label(),
            threads = status.thread_count,
            tasks = status.task_count,
            error = status.last_error.as_deref().unwrap_or(""),
            "connection"
        );
    }
    for task in &view.tasks {
        info!(
            task = %task.merged_id,
            connection = %task.connection_name,
            name = %task.task.name,
            thread = %task.thread_title,
            "running"
        );
    }
}
