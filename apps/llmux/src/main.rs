use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use llmux_auth::{
    AuthManager, FillFirstSelector, FileTokenStore, MappedSecretSource, MultiSourceSecret,
    RefreshPolicy, RetryConfig, RoundRobinSelector, Selector,
};
use llmux_common::{AppConfig, RoutingStrategy};
use llmux_router::{AmpGateway, RelayExecutor, RelayHub};
use llmux_watch::{spawn_update_applier, Dispatcher, Watcher};

mod cli;

/// Dedicated exit code for a busy listen port, distinct from general
/// failures.
const EXIT_PORT_IN_USE: i32 = 16;

const AMP_ISSUER_URL: &str = "https://ampcode.com";
const AMP_KEY_ENV_VAR: &str = "AMP_API_KEY";

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

fn selector_for(strategy: RoutingStrategy) -> Box<dyn Selector> {
    match strategy {
        RoutingStrategy::RoundRobin => Box::new(RoundRobinSelector::default()),
        RoutingStrategy::FillFirst => Box::new(FillFirstSelector),
    }
}

fn retry_config_for(config: &AppConfig) -> RetryConfig {
    RetryConfig {
        request_retry: config.request_retry,
        max_retry_interval: Duration::from_secs(config.max_retry_interval),
        disable_cooling: config.disable_cooling,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = cli::Cli::parse();
    let config = AppConfig::load(&args.config)
        .with_context(|| format!("load config from {}", args.config.display()))?;

    let auth_dir = args
        .auth_dir
        .clone()
        .unwrap_or_else(|| expand_home(&config.auth_dir));
    let host = args.host.clone().unwrap_or_else(|| config.host.clone());
    let port = args.port.unwrap_or(config.port);

    // Core: store, manager, refresh loop.
    let store = Arc::new(FileTokenStore::new(&auth_dir));
    let refresh_policy = RefreshPolicy::default()
        .with_lead("codex", Duration::from_secs(30 * 60))
        .with_lead("claude", Duration::from_secs(30 * 60));
    let manager = Arc::new(AuthManager::new(
        store,
        selector_for(config.routing_strategy),
        retry_config_for(&config),
        refresh_policy,
    ));
    manager.set_oauth_model_alias(&config.oauth_model_alias);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let refresh_task = manager.spawn_refresh_loop(shutdown_rx);

    // Amp secret chain: per-client mapping over config > env > secrets file.
    let multi_secret = Arc::new(MultiSourceSecret::new("amp", AMP_ISSUER_URL, AMP_KEY_ENV_VAR));
    if let Some(key) = config.ampcode.upstream_api_key.as_deref() {
        multi_secret.update_explicit_key(key).await;
    }
    let mapped_secret = Arc::new(MappedSecretSource::new(multi_secret.clone()));
    mapped_secret.update_mappings(&config.ampcode.upstream_api_keys);

    let gateway = AmpGateway::new(manager.clone(), mapped_secret.clone(), &config)
        .context("build amp gateway")?;

    // Watcher -> dispatcher -> manager pipeline.
    let dispatcher = Dispatcher::new();
    let (update_tx, update_rx) = tokio::sync::mpsc::channel(256);
    dispatcher.set_queue(Some(update_tx));
    let applier_task = spawn_update_applier(manager.clone(), update_rx);

    let reload_manager = manager.clone();
    let reload_gateway = gateway.clone();
    let reload_multi = multi_secret.clone();
    let reload_mapped = mapped_secret.clone();
    let watcher = Watcher::start(
        config.clone(),
        &args.config,
        &auth_dir,
        dispatcher.clone(),
        move |new_config: &AppConfig| {
            reload_manager.set_retry_config(retry_config_for(new_config));
            reload_manager.set_oauth_model_alias(&new_config.oauth_model_alias);
            reload_gateway.apply_config(new_config);
            reload_mapped.update_mappings(&new_config.ampcode.upstream_api_keys);
            let explicit = new_config.ampcode.upstream_api_key.clone().unwrap_or_default();
            let multi = reload_multi.clone();
            tokio::spawn(async move {
                multi.update_explicit_key(&explicit).await;
                multi.invalidate_cache().await;
            });
        },
    )
    .context("start watcher")?;

    // Relay workers surface as runtime-sourced auth updates and executors.
    let relay_dispatcher = dispatcher.clone();
    let relay_manager = manager.clone();
    let hub_cell: Arc<std::sync::OnceLock<Arc<RelayHub>>> = Arc::new(std::sync::OnceLock::new());
    let hook_hub = hub_cell.clone();
    let relay_hub = RelayHub::with_update_hook(move |update| {
        if update.action == llmux_auth::AuthUpdateAction::Add
            && let Some(auth) = update.auth.as_ref()
            && let Some(hub) = hook_hub.get()
        {
            relay_manager.register_executor(Arc::new(RelayExecutor::new(
                auth.provider.clone(),
                Arc::clone(hub),
            )));
        }
        relay_dispatcher.enqueue(update);
    });
    let _ = hub_cell.set(relay_hub.clone());

    let app = axum::Router::new()
        .merge(relay_hub.router())
        .merge(gateway.router());

    let bind = format!("{host}:{port}");
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            tracing::error!(%bind, "listen port already in use");
            std::process::exit(EXIT_PORT_IN_USE);
        }
        Err(err) => return Err(err).with_context(|| format!("bind {bind}")),
    };
    tracing::info!(%bind, auth_dir = %auth_dir.display(), "llmux listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serve")?;

    // Drain: cancel dispatch, close the watcher, fail over relay sessions.
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    dispatcher.set_queue(None);
    watcher.stop().await;
    relay_hub.close_all("manager stopped");
    refresh_task.abort();
    applier_task.abort();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
