mod admin;
mod backend;
mod catalog;
mod cli;
mod discovery;
mod document;
mod merge;
mod proxy;
mod rank;
#[cfg(test)]
mod testutil;

use anyhow::{Context, Result};
use clap::Parser;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use rmcp::transport::streamable_http_server::{
    StreamableHttpService, session::local::LocalSessionManager,
};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use backend::BackendManager;
use backend::transport::RmcpFactory;
use catalog::Catalog;
use document::DocumentStore;
use proxy::ProxyServer;

/// Everything produced by shared initialization, ready for either transport.
struct Initialized {
    store: Arc<DocumentStore>,
    manager: Arc<BackendManager>,
    proxy: ProxyServer,
    shutdown: Arc<Notify>,
}

/// Shared startup: tracing, document load, discovery sweep, idle reaper, and
/// the document watcher. A corrupt document is fatal here.
async fn initialize(args: &cli::Cli) -> Result<Initialized> {
    // Logs go to stderr so the stdio MCP transport stays clean.
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let path = args.config.clone().unwrap_or_else(cli::default_document_path);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }

    let store = Arc::new(DocumentStore::load(&path)?);
    let manager = BackendManager::new(Arc::new(RmcpFactory::new()));
    let catalog = Catalog::new();

    info!(
        document = %path.display(),
        backends = store.snapshot().await.servers.len(),
        "multigate starting"
    );

    discovery::run_sweep(&store, &manager, &catalog).await;

    let max_tools = store
        .snapshot()
        .await
        .retrieval
        .as_ref()
        .and_then(|r| r.max_tools);
    let ranker = Arc::new(rank::Passthrough::new(max_tools));
    let proxy = ProxyServer::new(
        Arc::clone(&store),
        Arc::clone(&manager),
        Arc::clone(&catalog),
        ranker,
    );

    let shutdown = Arc::new(Notify::new());

    {
        let manager = Arc::clone(&manager);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(manager.run_idle_reaper(shutdown));
    }
    {
        let store = Arc::clone(&store);
        let proxy = proxy.clone();
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(document::watch_document(store, proxy, shutdown));
    }

    Ok(Initialized {
        store,
        manager,
        proxy,
        shutdown,
    })
}

/// Wait for SIGTERM/SIGINT (ctrl-c elsewhere).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}

/// Serve a single downstream client over stdio.
async fn run_stdio(init: Initialized) -> Result<()> {
    info!("serving MCP over stdio");
    let service = init.proxy.clone().serve(stdio()).await?;

    // Capture the downstream session for notifications at run-start.
    init.proxy.notifier.attach(service.peer().clone());

    tokio::select! {
        result = service.waiting() => {
            if let Err(e) = result {
                warn!(error = %e, "MCP service exited with error");
            }
        }
        _ = shutdown_signal() => {}
    }

    init.proxy.notifier.detach();
    info!("shutting down");
    init.shutdown.notify_waiters();
    init.manager.shutdown().await;
    Ok(())
}

/// Serve MCP over streamable HTTP at /mcp, with the admin API on the same
/// listener. A bind failure is fatal (nonzero exit).
async fn run_http(init: Initialized, listen: &str, admin_token: Option<String>) -> Result<()> {
    let proxy = init.proxy.clone();
    let mcp_service = StreamableHttpService::new(
        move || Ok(proxy.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let admin_state = admin::AdminState {
        proxy: init.proxy.clone(),
        manager: Arc::clone(&init.manager),
        store: Arc::clone(&init.store),
        token: admin_token,
    };
    let app = admin::router(admin_state).nest_service("/mcp", mcp_service);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(listen = %listen, "serving MCP over streamable HTTP at /mcp");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    init.proxy.notifier.detach();
    info!("shutting down");
    init.shutdown.notify_waiters();
    init.manager.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let admin_token = args
        .admin_token
        .clone()
        .or_else(|| std::env::var("MULTIGATE_ADMIN_TOKEN").ok());

    let init = initialize(&args).await?;
    match args.listen.clone() {
        Some(listen) => run_http(init, &listen, admin_token).await,
        None => run_stdio(init).await,
    }
}
