//! Bootstrap: parses the CLI, loads config, and either runs the gateway
//! in the foreground (`start`) or dispatches a thin request against an
//! already-running instance (`stop`/`status`/`attach`/`set-config`/
//! `get-config`). Grounded on the teacher's `main.rs` `initialize()`
//! sequencing (tracing-to-stderr, config load, spawn health/watcher
//! tasks), reworked to wire the new C1–C11 components instead of the
//! teacher's registry/backend-manager/admin stack.

mod audit;
mod backend;
mod cli;
#[cfg(feature = "control")]
mod control;
mod config;
mod error;
mod events;
mod mcp;
mod router;
mod transport;
mod upstream;

use clap::Parser;
use cli::{Cli, Command};
use config::Config;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn pidfile_path(config: &Config) -> PathBuf {
    config.state_dir().join("xzcli.pid")
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            cli::EXIT_ERROR
        }
    };
    ExitCode::from(code as u8)
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config_path = shellexpand::tilde(&cli.config.to_string_lossy()).into_owned();
    let config_path = PathBuf::from(config_path);

    match cli.command.unwrap_or(Command::Start { daemon: false }) {
        Command::Start { daemon } => cmd_start(&config_path, daemon).await,
        Command::Stop => cmd_stop(&config_path).await,
        Command::Restart { daemon } => {
            cmd_stop(&config_path).await?;
            cmd_start(&config_path, daemon).await
        }
        Command::Status => cmd_status(&config_path).await,
        Command::Attach => cmd_attach(&config_path).await,
        Command::SetConfig { entry } => cmd_set_config(&config_path, &entry).await,
        Command::GetConfig { key } => cmd_get_config(&config_path, key.as_deref()).await,
    }
}

async fn cmd_start(config_path: &Path, daemon: bool) -> anyhow::Result<i32> {
    if daemon {
        let exe = std::env::current_exe()?;
        std::process::Command::new(exe)
            .arg("--config")
            .arg(config_path)
            .arg("start")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        return Ok(cli::EXIT_SUCCESS);
    }

    let config = Config::load(config_path)?;
    let pidfile = pidfile_path(&config);
    if let Some(parent) = pidfile.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&pidfile, std::process::id().to_string())?;

    let result = run_gateway(config_path, config).await;
    let _ = std::fs::remove_file(&pidfile);
    result.map(|()| cli::EXIT_SUCCESS)
}

/// Construct every C1–C11 component, wire the supporting tasks, and run
/// until SIGINT/SIGTERM.
async fn run_gateway(config_path: &Path, config: Config) -> anyhow::Result<()> {
    let config_dir = config_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let state_dir = config.state_dir();
    std::fs::create_dir_all(&state_dir)?;

    let backends = config.normalized_backends(&config_dir)?;
    let events = Arc::new(events::EventBus::new());
    let services = Arc::new(backend::registry::ServiceRegistry::new());
    let supervisor = backend::supervisor::RetrySupervisor::new(Arc::clone(&services));

    let failed = backend::start_all(&services, &events, backends).await;
    supervisor.schedule_failed_services_retry(&failed).await;

    let audit = Arc::new(
        audit::AuditLog::open(state_dir.join("tool-calls.jsonl"), config.max_audit_records).await?,
    );

    let dispatcher = router::RouterDispatcher::new();
    let custom = Arc::new(router::custom::CustomToolHandler::new(dispatcher.clone()));
    let tool_registry = Arc::new(router::ToolRegistry::new(
        Arc::clone(&services),
        Arc::clone(&custom),
        Arc::clone(&audit),
    ));
    dispatcher.bind(&tool_registry);

    let mut seed = std::collections::HashMap::new();
    for (service_name, tool_overrides) in &config.mcp_server_config {
        for (tool_name, tool_override) in tool_overrides {
            let prefixed = router::prefixed_name(service_name, tool_name);
            seed.insert(prefixed, tool_override.clone());
        }
    }
    tool_registry.seed_tool_config(seed);
    tool_registry.sync_tool_config().await;

    let mcp_handler = Arc::new(mcp::handler::McpHandler::new(
        Arc::clone(&tool_registry),
        "xzcli".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    ));

    let upstream_manager = upstream::manager::UpstreamManager::initialize(
        &config.mcp_endpoints,
        Arc::clone(&mcp_handler),
        Arc::clone(&events),
        config.connection.clone(),
    );
    upstream_manager.connect().await;

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let health_check_handle = tokio::spawn({
        let upstream_manager = Arc::clone(&upstream_manager);
        let shutdown = Arc::clone(&shutdown);
        async move { upstream_manager.run_health_check_loop(shutdown).await }
    });

    let shared_config = Arc::new(arc_swap::ArcSwap::from_pointee(config.clone()));
    let watcher_handle = tokio::spawn({
        let services = Arc::clone(&services);
        let supervisor = Arc::clone(&supervisor);
        let tool_registry = Arc::clone(&tool_registry);
        let events = Arc::clone(&events);
        let shared_config = Arc::clone(&shared_config);
        let shutdown = Arc::clone(&shutdown);
        let config_path = config_path.to_path_buf();
        async move {
            config::watch_config(
                config_path,
                shared_config,
                move |diff| {
                    let services = Arc::clone(&services);
                    let supervisor = Arc::clone(&supervisor);
                    let tool_registry = Arc::clone(&tool_registry);
                    let events = Arc::clone(&events);
                    tokio::spawn(async move {
                        apply_config_diff(services, supervisor, tool_registry, events, diff).await;
                    });
                },
                shutdown,
            )
            .await;
        }
    });

    #[cfg(feature = "control")]
    let control_handle = if config.control.enabled {
        let state = Arc::new(control::ControlState {
            config: Arc::clone(&shared_config),
            services: Arc::clone(&services),
            router: Arc::clone(&tool_registry),
            upstream: Arc::clone(&upstream_manager),
            mcp_handler: Arc::clone(&mcp_handler),
            audit: Arc::clone(&audit),
            events: Arc::clone(&events),
            bearer_token: config.control.bearer_token.clone(),
        });
        let listen = config.control.listen.clone();
        let shutdown = Arc::clone(&shutdown);
        Some(tokio::spawn(
            async move { control::start(state, &listen, shutdown).await },
        ))
    } else {
        None
    };

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");

    shutdown.notify_waiters();
    upstream_manager.shutdown().await;
    backend::stop_all(&services, &supervisor).await;

    health_check_handle.abort();
    watcher_handle.abort();
    #[cfg(feature = "control")]
    if let Some(handle) = control_handle {
        handle.abort();
    }

    Ok(())
}

async fn apply_config_diff(
    services: Arc<backend::registry::ServiceRegistry>,
    supervisor: Arc<backend::supervisor::RetrySupervisor>,
    tool_registry: Arc<router::ToolRegistry>,
    events: Arc<events::EventBus>,
    diff: config::ConfigDiff,
) {
    let mut newly_failed = Vec::new();

    for (name, backend_config) in diff.added.into_iter().chain(diff.changed) {
        if let Some(existing) = services.get_service(&name).await {
            existing.disconnect("config changed").await;
        }
        services.add_config(backend_config.clone());
        let service = Arc::new(backend::service::Service::new(backend_config, Arc::clone(&events)));
        services.add_service(Arc::clone(&service));
        if service.connect().await.is_err() {
            newly_failed.push(name);
        }
    }

    for name in diff.removed {
        supervisor.stop_retry(&name).await;
        if let Some(service) = services.get_service(&name).await {
            service.disconnect("removed from config").await;
        }
        services.remove_service(&name);
        services.remove_config(&name);
    }

    services.rebuild_tool_index().await;
    tool_registry.sync_tool_config().await;
    supervisor.schedule_failed_services_retry(&newly_failed).await;
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn cmd_stop(config_path: &Path) -> anyhow::Result<i32> {
    let config = Config::load(config_path)?;
    let pidfile = pidfile_path(&config);
    let pid_text = match std::fs::read_to_string(&pidfile) {
        Ok(text) => text,
        Err(_) => {
            eprintln!("no running instance found");
            return Ok(cli::EXIT_ERROR);
        }
    };
    let pid: i32 = pid_text.trim().parse()?;

    #[cfg(unix)]
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    let _ = std::fs::remove_file(&pidfile);
    Ok(cli::EXIT_SUCCESS)
}

fn control_base_url(config: &Config) -> String {
    format!("http://{}", config.control.listen)
}

async fn cmd_status(config_path: &Path) -> anyhow::Result<i32> {
    let config = Config::load(config_path)?;
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/status", control_base_url(&config)))
        .send()
        .await?;
    let body: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(cli::EXIT_SUCCESS)
}

async fn cmd_attach(config_path: &Path) -> anyhow::Result<i32> {
    let config = Config::load(config_path)?;
    let ws_url = format!("ws://{}/", config.control.listen);
    let (stream, _response) = tokio_tungstenite::connect_async(ws_url).await?;
    let (_write, mut read) = futures_util::StreamExt::split(stream);
    while let Some(frame) = futures_util::StreamExt::next(&mut read).await {
        match frame {
            Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => println!("{text}"),
            Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    Ok(cli::EXIT_SUCCESS)
}

async fn cmd_set_config(config_path: &Path, entry: &str) -> anyhow::Result<i32> {
    let (key, value) = match cli::parse_set_config(entry) {
        Ok(pair) => pair,
        Err(message) => {
            eprintln!("{message}");
            return Ok(cli::EXIT_USAGE);
        }
    };

    let config = Config::load(config_path)?;
    let client = reqwest::Client::new();
    let mut current: serde_json::Value = client
        .get(format!("{}/config", control_base_url(&config)))
        .send()
        .await?
        .json()
        .await?;

    if let Some(object) = current.as_object_mut() {
        object.insert(key.to_string(), serde_json::Value::String(value.to_string()));
    }

    client
        .put(format!("{}/config", control_base_url(&config)))
        .json(&current)
        .send()
        .await?;
    Ok(cli::EXIT_SUCCESS)
}

async fn cmd_get_config(config_path: &Path, key: Option<&str>) -> anyhow::Result<i32> {
    let config = Config::load(config_path)?;
    let client = reqwest::Client::new();
    let current: serde_json::Value = client
        .get(format!("{}/config", control_base_url(&config)))
        .send()
        .await?
        .json()
        .await?;

    let value = match key {
        Some(key) => current.get(key).cloned().unwrap_or(serde_json::Value::Null),
        None => current,
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(cli::EXIT_SUCCESS)
}
