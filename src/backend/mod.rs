pub mod error;
pub mod guard;
pub mod transport;

use anyhow::Result;
use dashmap::DashMap;
use rmcp::model::{
    CallToolResult, GetPromptResult, JsonObject, Prompt, ReadResourceResult, Resource, Tool,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::document::ServerConfig;
use error::ProxyError;
use transport::{CapabilitySnapshot, McpTransport, TransportFactory};

/// Bound on a single backend open (spawn/connect + MCP initialize).
const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Global cap on concurrently in-flight opens.
const MAX_CONCURRENT_OPENS: usize = 8;

/// How often the idle reaper wakes up.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// A live backend session handle. The manager exclusively owns the transport;
/// everything else holds the session only through this handle.
pub struct Session {
    pub name: String,
    pub config: ServerConfig,
    transport: Box<dyn McpTransport>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl Session {
    pub fn capabilities(&self) -> CapabilitySnapshot {
        self.transport.capabilities()
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.transport.list_tools().await
    }

    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult> {
        self.transport.call_tool(tool, arguments).await
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        self.transport.list_prompts().await
    }

    pub async fn get_prompt(
        &self,
        prompt: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult> {
        self.transport.get_prompt(prompt, arguments).await
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        self.transport.list_resources().await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.transport.read_resource(uri).await
    }

    async fn close(&self) {
        if let Err(e) = self.transport.close().await {
            warn!(backend = %self.name, error = %e, "error closing transport");
        }
    }
}

/// Re-inserts a pending config on drop unless defused. Guarantees the config
/// is restored before any error or cancellation unwinds out of the open path.
struct RestoreGuard<'a> {
    pending: &'a DashMap<String, ServerConfig>,
    name: &'a str,
    config: Option<ServerConfig>,
}

impl<'a> RestoreGuard<'a> {
    fn new(
        pending: &'a DashMap<String, ServerConfig>,
        name: &'a str,
        config: ServerConfig,
    ) -> Self {
        Self {
            pending,
            name,
            config: Some(config),
        }
    }

    fn defuse(mut self) {
        self.config = None;
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if let Some(config) = self.config.take() {
            self.pending.insert(self.name.to_string(), config);
        }
    }
}

/// Owns every backend session and its lifecycle: pending-config registry,
/// connect-on-demand with per-backend serialization and a global open cap,
/// idle reaping, and shutdown.
pub struct BackendManager {
    factory: Arc<dyn TransportFactory>,
    /// Declared-but-not-connected backends. A name is in exactly one of
    /// `pending` or `live` at any observable instant.
    pending: DashMap<String, ServerConfig>,
    live: DashMap<String, Arc<Session>>,
    /// Per-backend serialization locks for the open path.
    open_locks: DashMap<String, Arc<Mutex<()>>>,
    open_semaphore: Arc<Semaphore>,
    open_timeout: Duration,
    last_used: DashMap<String, Instant>,
    pinned: DashMap<String, bool>,
}

impl BackendManager {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Self::with_limits(factory, OPEN_TIMEOUT, MAX_CONCURRENT_OPENS)
    }

    pub fn with_limits(
        factory: Arc<dyn TransportFactory>,
        open_timeout: Duration,
        max_concurrent_opens: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            pending: DashMap::new(),
            live: DashMap::new(),
            open_locks: DashMap::new(),
            open_semaphore: Arc::new(Semaphore::new(max_concurrent_opens)),
            open_timeout,
            last_used: DashMap::new(),
            pinned: DashMap::new(),
        })
    }

    /// Declare a backend. Idempotent; never connects.
    pub fn register(&self, name: &str, config: ServerConfig) {
        let always_on = config.always_on;
        if !self.live.contains_key(name) {
            self.pending.entry(name.to_string()).or_insert(config);
        }
        self.pinned.entry(name.to_string()).or_insert(always_on);
    }

    /// Return the live session for `name`, opening one if a pending config
    /// exists. Opens are serialized per backend and bounded globally; on any
    /// failure the pending config is restored before the error propagates, so
    /// the backend stays retryable.
    pub async fn get_or_open(&self, name: &str) -> Result<Arc<Session>, ProxyError> {
        if let Some(session) = self.live.get(name) {
            self.record_use(name);
            return Ok(Arc::clone(session.value()));
        }

        let lock = self
            .open_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _serialized = lock.lock().await;

        // Re-check under the lock: a racing open may have won.
        if let Some(session) = self.live.get(name) {
            self.record_use(name);
            return Ok(Arc::clone(session.value()));
        }

        let Some((_, config)) = self.pending.remove(name) else {
            return Err(ProxyError::UnknownBackend(name.to_string()));
        };
        let restore = RestoreGuard::new(&self.pending, name, config.clone());

        // Interpolate ${VAR} references first so the SSRF check resolves the
        // real target host, then hand the expanded config to the factory.
        let expanded =
            guard::expand_config(&config).map_err(|e| ProxyError::TransportFailed {
                backend: name.to_string(),
                source: e,
            })?;
        if let Some(url) = &expanded.url {
            guard::check_url(name, url).await?;
        }

        let _permit = self
            .open_semaphore
            .acquire()
            .await
            .expect("open semaphore never closed");

        let opened = tokio::time::timeout(self.open_timeout, self.factory.open(name, &expanded))
            .await
            .map_err(|_| ProxyError::OpenTimeout {
                backend: name.to_string(),
                timeout: self.open_timeout,
            })?
            .map_err(|e| ProxyError::TransportFailed {
                backend: name.to_string(),
                source: e,
            })?;

        restore.defuse();
        let session = Arc::new(Session {
            name: name.to_string(),
            config,
            transport: opened,
        });
        self.live.insert(name.to_string(), Arc::clone(&session));
        self.record_use(name);
        info!(backend = %name, "backend session opened");
        Ok(session)
    }

    /// Close a live session. Runs under the backend's serialization lock so
    /// open/close transitions are totally ordered, and the pending config is
    /// reinstated before the transport-close await, so a concurrent
    /// `get_or_open` always sees the backend as either live or pending.
    pub async fn close(&self, name: &str) {
        let lock = self
            .open_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _serialized = lock.lock().await;

        let Some((_, session)) = self.live.remove(name) else {
            return;
        };
        self.pending
            .insert(name.to_string(), session.config.clone());
        session.close().await;
        info!(backend = %name, "backend session closed");
    }

    /// Drop a backend entirely: live session, pending config, and bookkeeping.
    /// Used by unregistration; nothing is reinstated.
    pub async fn remove(&self, name: &str) {
        let lock = self
            .open_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _serialized = lock.lock().await;

        self.pending.remove(name);
        self.pinned.remove(name);
        self.last_used.remove(name);
        if let Some((_, session)) = self.live.remove(name) {
            session.close().await;
            info!(backend = %name, "backend removed and transport closed");
        }
        self.open_locks.remove(name);
    }

    /// Refresh the last-used monotonic timestamp.
    pub fn record_use(&self, name: &str) {
        self.last_used.insert(name.to_string(), Instant::now());
    }

    /// Control whether the idle reaper may close this backend.
    pub fn mark_pinned(&self, name: &str, pinned: bool) {
        self.pinned.insert(name.to_string(), pinned);
    }

    pub fn is_pinned(&self, name: &str) -> bool {
        self.pinned.get(name).is_some_and(|p| *p.value())
    }

    /// Whether the backend is declared at all (live or pending).
    pub fn is_registered(&self, name: &str) -> bool {
        self.live.contains_key(name) || self.pending.contains_key(name)
    }

    pub fn connected_names(&self) -> Vec<String> {
        self.live.iter().map(|e| e.key().clone()).collect()
    }

    pub fn pending_names(&self) -> Vec<String> {
        self.pending.iter().map(|e| e.key().clone()).collect()
    }

    /// Close every live, non-pinned backend whose inactivity exceeds its idle
    /// timeout.
    pub async fn tick_idle_reaper(&self) {
        let now = Instant::now();
        let victims: Vec<String> = self
            .live
            .iter()
            .filter_map(|entry| {
                let name = entry.key();
                if self.is_pinned(name) {
                    return None;
                }
                let idle = self
                    .last_used
                    .get(name)
                    .map(|t| now.duration_since(*t.value()))
                    .unwrap_or(Duration::ZERO);
                (idle > entry.value().config.idle_timeout()).then(|| name.clone())
            })
            .collect();

        for name in victims {
            debug!(backend = %name, "idle timeout exceeded, reaping");
            self.close(&name).await;
        }
    }

    /// Long-lived reaper task. Runs until the shutdown notify fires.
    pub async fn run_idle_reaper(self: Arc<Self>, shutdown: Arc<Notify>) {
        let mut interval = tokio::time::interval(REAPER_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_idle_reaper().await;
                }
                _ = shutdown.notified() => {
                    debug!("idle reaper shutting down");
                    return;
                }
            }
        }
    }

    /// Close every session concurrently and clear all state.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> =
            self.live.iter().map(|e| Arc::clone(e.value())).collect();
        self.live.clear();
        self.pending.clear();

        let mut join_set = tokio::task::JoinSet::new();
        for session in sessions {
            join_set.spawn(async move {
                session.close().await;
            });
        }
        while join_set.join_next().await.is_some() {}

        info!("all backend sessions closed");
    }
}
