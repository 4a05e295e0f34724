use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Regex for valid backend names: alphanumeric start, then alphanumeric/underscore/hyphen,
/// max 64 chars. The character set guarantees the `::` qualifier separator can never
/// occur inside a backend name.
static BACKEND_NAME_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{0,63}$").unwrap());

/// Validate a backend name against the safe character set.
pub fn validate_backend_name(name: &str) -> Result<(), DocumentError> {
    if !BACKEND_NAME_RE.is_match(name) {
        return Err(DocumentError::Corrupt(format!(
            "invalid backend name '{name}': must match [a-zA-Z0-9][a-zA-Z0-9_-]{{0,63}}"
        )));
    }
    Ok(())
}

/// Errors from loading or persisting the servers document.
#[derive(Error, Debug)]
pub enum DocumentError {
    /// The document exists but cannot be parsed or violates the schema.
    #[error("servers document is corrupt: {0}")]
    Corrupt(String),

    /// The document cannot be written back to disk. The in-memory copy stands.
    #[error("servers document is unwritable: {0}")]
    Unwritable(String),
}

/// Transport hint for a backend endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    StreamableHttp,
    Sse,
}

/// User policy and last-observed metadata for one backend-local tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolPolicy {
    /// User decision. Set once at first discovery, never overwritten by rediscovery.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// True iff the latest discovery no longer saw this tool.
    #[serde(default)]
    pub stale: bool,

    /// Most recently observed description (refreshed on every discovery).
    #[serde(default)]
    pub description: String,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            stale: false,
            description: String::new(),
        }
    }
}

/// Per-backend configuration: exactly one of a local command or a remote URL,
/// plus connection policy and the discovered tool inventory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Command to spawn (local stdio backends). Exclusive with `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments for the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables for the child process. Scalar values are coerced
    /// to strings so `PORT: 8080` round-trips as `"8080"`.
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "string_values::deserialize"
    )]
    pub env: BTreeMap<String, String>,

    /// URL of a remote backend. Exclusive with `command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Optional transport hint for URL backends.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,

    /// Pinned backends stay connected for the lifetime of the proxy.
    #[serde(default)]
    pub always_on: bool,

    /// Idle timeout before a non-pinned live session is reaped.
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u64,

    /// Tool inventory keyed by backend-local tool name. BTreeMap keeps the
    /// serialized key order sorted so human diffs stay meaningful.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, ToolPolicy>,
}

impl ServerConfig {
    /// The effective transport for this backend.
    pub fn effective_transport(&self) -> TransportKind {
        if self.url.is_some() {
            self.transport.unwrap_or(TransportKind::StreamableHttp)
        } else {
            TransportKind::Stdio
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes * 60)
    }

    /// Check the command/url exclusivity invariant.
    pub fn validate_endpoint(&self, name: &str) -> Result<(), DocumentError> {
        match (self.command.is_some(), self.url.is_some()) {
            (true, true) => Err(DocumentError::Corrupt(format!(
                "backend '{name}': 'command' and 'url' are mutually exclusive"
            ))),
            (false, false) => Err(DocumentError::Corrupt(format!(
                "backend '{name}': one of 'command' or 'url' is required"
            ))),
            _ => Ok(()),
        }
    }

    /// True when two configs describe the same connection. Tool policy is
    /// deliberately excluded: merging discovery results must not read as a
    /// backend change during hot reload.
    pub fn connection_eq(&self, other: &Self) -> bool {
        self.command == other.command
            && self.args == other.args
            && self.env == other.env
            && self.url == other.url
            && self.transport == other.transport
            && self.always_on == other.always_on
            && self.idle_timeout_minutes == other.idle_timeout_minutes
    }
}

/// Optional settings for the pluggable retrieval extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrievalSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Cap on the number of tools returned from tools/list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tools: Option<usize>,
}

/// The unified declarative document: startup cache, user-edited policy, and
/// discovered-tool inventory in one file. This is the sole durable state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Declared backends in insertion order.
    #[serde(default)]
    pub servers: IndexMap<String, ServerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalSettings>,
}

impl Document {
    fn validate(&self) -> Result<(), DocumentError> {
        for (name, server) in &self.servers {
            validate_backend_name(name)?;
            server.validate_endpoint(name)?;
        }
        Ok(())
    }

    fn parse(raw: &str) -> Result<Self, DocumentError> {
        let doc: Document =
            serde_yaml_ng::from_str(raw).map_err(|e| DocumentError::Corrupt(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    /// Compute the connection-level diff between this document and a newer one.
    pub fn diff_servers(&self, new: &Document) -> DocumentDiff {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut changed = Vec::new();

        for (name, new_config) in &new.servers {
            match self.servers.get(name) {
                None => added.push((name.clone(), new_config.clone())),
                Some(old_config) if !old_config.connection_eq(new_config) => {
                    changed.push((name.clone(), new_config.clone()));
                }
                _ => {}
            }
        }

        for name in self.servers.keys() {
            if !new.servers.contains_key(name) {
                removed.push(name.clone());
            }
        }

        DocumentDiff {
            added,
            removed,
            changed,
        }
    }
}

/// Connection-level diff between two documents.
pub struct DocumentDiff {
    pub added: Vec<(String, ServerConfig)>,
    pub removed: Vec<String>,
    pub changed: Vec<(String, ServerConfig)>,
}

impl DocumentDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Owns the on-disk document file. All mutation goes through `update`; all
/// persistence goes through `save`, which writes a temporary sibling and
/// renames it into place so a crashing writer cannot leave a torn file.
pub struct DocumentStore {
    path: PathBuf,
    doc: RwLock<Document>,
}

impl DocumentStore {
    /// Load the document from `path`. A missing file yields an empty document.
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let doc = match std::fs::read_to_string(path) {
            Ok(raw) => Document::parse(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::default(),
            Err(e) => return Err(DocumentError::Corrupt(e.to_string())),
        };
        Ok(Self {
            path: path.to_path_buf(),
            doc: RwLock::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clone the current document.
    pub async fn snapshot(&self) -> Document {
        self.doc.read().await.clone()
    }

    /// Mutate the in-memory document under the write lock.
    pub async fn update<F: FnOnce(&mut Document)>(&self, f: F) {
        let mut doc = self.doc.write().await;
        f(&mut doc);
    }

    /// Replace the in-memory document wholesale (hot reload).
    pub async fn replace(&self, doc: Document) {
        *self.doc.write().await = doc;
    }

    /// Persist the current document atomically (temp sibling + rename).
    pub async fn save(&self) -> Result<(), DocumentError> {
        let doc = self.snapshot().await;
        let yaml = serde_yaml_ng::to_string(&doc)
            .map_err(|e| DocumentError::Unwritable(e.to_string()))?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return Err(DocumentError::Unwritable(e.to_string()));
        }

        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, &yaml)
            .await
            .map_err(|e| DocumentError::Unwritable(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| DocumentError::Unwritable(e.to_string()))?;

        debug!(path = %self.path.display(), servers = doc.servers.len(), "document saved");
        Ok(())
    }
}

// --- Defaults ---

fn default_true() -> bool {
    true
}

fn default_idle_timeout_minutes() -> u64 {
    5
}

// --- env value coercion ---

mod string_values {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use std::collections::BTreeMap;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
        let mut out = BTreeMap::new();
        for (key, value) in raw {
            let coerced = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null => String::new(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "env value for '{key}' must be a scalar, got {other}"
                    )));
                }
            };
            out.insert(key, coerced);
        }
        Ok(out)
    }
}

/// Watch the document file for edits and apply connection-level diffs through
/// the proxy. A reload that fails to parse is rejected and the previous
/// document stays live. Runs until the shutdown notify fires.
pub async fn watch_document(
    store: Arc<DocumentStore>,
    proxy: crate::proxy::ProxyServer,
    shutdown: Arc<tokio::sync::Notify>,
) {
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

    let path = store.path().to_path_buf();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

    let watcher_result: std::result::Result<RecommendedWatcher, _> =
        notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res
                && matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                )
            {
                let _ = tx.try_send(());
            }
        });

    let mut watcher = match watcher_result {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create document watcher");
            return;
        }
    };

    // Watch the parent directory: editors often replace the file via rename,
    // which would drop a watch on the file itself.
    let watch_target = path.parent().filter(|p| !p.as_os_str().is_empty());
    let watch_result = match watch_target {
        Some(dir) => watcher.watch(dir, RecursiveMode::NonRecursive),
        None => watcher.watch(&path, RecursiveMode::NonRecursive),
    };
    if let Err(e) = watch_result {
        error!(path = %path.display(), error = %e, "failed to watch document");
        return;
    }

    info!(path = %path.display(), "document watcher started");

    let debounce = Duration::from_millis(500);

    loop {
        tokio::select! {
            Some(()) = rx.recv() => {
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}

                let raw = match tokio::fs::read_to_string(&path).await {
                    Ok(r) => r,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        warn!(error = %e, "failed to read document, keeping current");
                        continue;
                    }
                };
                let new_doc = match Document::parse(&raw) {
                    Ok(d) => d,
                    Err(e) => {
                        error!(error = %e, "rejecting corrupt document edit, keeping current");
                        continue;
                    }
                };

                let old_doc = store.snapshot().await;
                let diff = old_doc.diff_servers(&new_doc);
                store.replace(new_doc).await;

                if diff.is_empty() {
                    debug!("document reloaded, no backend changes");
                    continue;
                }

                info!(
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    changed = diff.changed.len(),
                    "applying document changes"
                );

                for name in &diff.removed {
                    if let Err(e) = proxy.unregister_backend(name, false).await {
                        warn!(backend = %name, error = %e, "error removing backend");
                    }
                }

                for (name, config) in &diff.changed {
                    if let Err(e) = proxy.unregister_backend(name, false).await {
                        warn!(backend = %name, error = %e, "error removing changed backend");
                    }
                    if let Err(e) = proxy.register_backend(name, config.clone(), false).await {
                        warn!(backend = %name, error = %e, "failed to re-register changed backend");
                    }
                }

                for (name, config) in &diff.added {
                    if let Err(e) = proxy.register_backend(name, config.clone(), false).await {
                        warn!(backend = %name, error = %e, "failed to register new backend");
                    }
                }
            }
            _ = shutdown.notified() => {
                info!("document watcher shutting down");
                return;
            }
        }
    }
}
