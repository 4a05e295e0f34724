//! Test utilities for multigate: a controllable mock transport and factory
//! implementing the transport seam, plus small fixture builders.
//!
//! Only compiled under `#[cfg(test)]`. The mocks let manager, discovery, and
//! proxy logic be exercised without child processes or network connections.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use rmcp::model::{
    CallToolResult, Content, GetPromptResult, JsonObject, Prompt, PromptMessage,
    PromptMessageRole, RawResource, ReadResourceResult, Resource, ResourceContents, Tool,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::transport::{CapabilitySnapshot, McpTransport, TransportFactory};
use crate::document::{Document, DocumentStore, ServerConfig};

/// RAII guard that decrements a shared counter on drop, so cancelled futures
/// cannot leak the in-flight count.
struct CountGuard(Arc<AtomicUsize>);

impl CountGuard {
    fn new(counter: &Arc<AtomicUsize>, max_seen: &Arc<AtomicUsize>) -> Self {
        let current = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max_seen.fetch_max(current, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A scripted MCP session for one mock backend.
pub struct MockTransport {
    backend: String,
    capabilities: CapabilitySnapshot,
    tools: Vec<Tool>,
    prompts: Vec<Prompt>,
    resources: Vec<Resource>,
    fail_calls: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
    call_log: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl McpTransport for MockTransport {
    fn capabilities(&self) -> CapabilitySnapshot {
        self.capabilities
    }

    async fn list_tools(&self) -> Result<Vec<Tool>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, tool: &str, arguments: Option<JsonObject>) -> Result<CallToolResult> {
        self.call_log
            .lock()
            .unwrap()
            .push((self.backend.clone(), tool.to_string()));
        if self.fail_calls.load(Ordering::SeqCst) {
            anyhow::bail!("injected call failure on '{}'", self.backend);
        }
        let echo = serde_json::json!({
            "backend": self.backend,
            "tool": tool,
            "args": arguments.map(serde_json::Value::Object).unwrap_or_default(),
        });
        Ok(CallToolResult::success(vec![Content::text(
            echo.to_string(),
        )]))
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        Ok(self.prompts.clone())
    }

    async fn get_prompt(
        &self,
        prompt: &str,
        _arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult> {
        Ok(GetPromptResult {
            description: Some(format!("{}:{prompt}", self.backend)),
            messages: vec![PromptMessage::new_text(
                PromptMessageRole::Assistant,
                format!("prompt {prompt} from {}", self.backend),
            )],
        })
    }

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        Ok(self.resources.clone())
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::TextResourceContents {
                uri: uri.to_string(),
                mime_type: Some("text/plain".to_string()),
                text: format!("{} owns {uri}", self.backend),
                meta: None,
            }],
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scriptable transport factory: canned tool/prompt/resource sets per backend,
/// error injection, artificial open latency, and open-concurrency tracking.
pub struct MockFactory {
    open_attempts: AtomicUsize,
    fail_all_opens: AtomicBool,
    fail_open_backends: DashMap<String, ()>,
    open_delay: Mutex<Duration>,
    tools: DashMap<String, Vec<Tool>>,
    prompts: DashMap<String, Vec<Prompt>>,
    resources: DashMap<String, Vec<Resource>>,
    capabilities: DashMap<String, CapabilitySnapshot>,
    fail_calls: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
    call_log: Arc<Mutex<Vec<(String, String)>>>,
    opens_in_flight: Arc<AtomicUsize>,
    max_seen_opens: Arc<AtomicUsize>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open_attempts: AtomicUsize::new(0),
            fail_all_opens: AtomicBool::new(false),
            fail_open_backends: DashMap::new(),
            open_delay: Mutex::new(Duration::ZERO),
            tools: DashMap::new(),
            prompts: DashMap::new(),
            resources: DashMap::new(),
            capabilities: DashMap::new(),
            fail_calls: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicUsize::new(0)),
            call_log: Arc::new(Mutex::new(Vec::new())),
            opens_in_flight: Arc::new(AtomicUsize::new(0)),
            max_seen_opens: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_all_opens.store(fail, Ordering::SeqCst);
    }

    pub fn fail_opens_for(&self, backend: &str) {
        self.fail_open_backends.insert(backend.to_string(), ());
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    pub fn set_tools(&self, backend: &str, tools: Vec<Tool>) {
        self.tools.insert(backend.to_string(), tools);
    }

    pub fn set_prompts(&self, backend: &str, prompts: Vec<Prompt>) {
        self.prompts.insert(backend.to_string(), prompts);
    }

    pub fn set_resources(&self, backend: &str, resources: Vec<Resource>) {
        self.resources.insert(backend.to_string(), resources);
    }

    pub fn set_capabilities(&self, backend: &str, caps: CapabilitySnapshot) {
        self.capabilities.insert(backend.to_string(), caps);
    }

    pub fn fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Peak number of concurrently in-flight opens observed.
    pub fn max_seen_opens(&self) -> usize {
        self.max_seen_opens.load(Ordering::SeqCst)
    }

    /// All forwarded calls as (backend, tool) pairs.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.call_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open(&self, name: &str, _config: &ServerConfig) -> Result<Box<dyn McpTransport>> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        let _guard = CountGuard::new(&self.opens_in_flight, &self.max_seen_opens);

        let delay = *self.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_all_opens.load(Ordering::SeqCst) || self.fail_open_backends.contains_key(name)
        {
            anyhow::bail!("connection refused for '{name}'");
        }

        Ok(Box::new(MockTransport {
            backend: name.to_string(),
            capabilities: self
                .capabilities
                .get(name)
                .map(|c| *c.value())
                .unwrap_or_else(CapabilitySnapshot::all),
            tools: self.tools.get(name).map(|t| t.value().clone()).unwrap_or_default(),
            prompts: self
                .prompts
                .get(name)
                .map(|p| p.value().clone())
                .unwrap_or_default(),
            resources: self
                .resources
                .get(name)
                .map(|r| r.value().clone())
                .unwrap_or_default(),
            fail_calls: Arc::clone(&self.fail_calls),
            closed: Arc::clone(&self.closed),
            call_log: Arc::clone(&self.call_log),
        }))
    }
}

// --- Fixture builders ---

/// A minimal stdio backend config.
pub fn stdio_config(always_on: bool) -> ServerConfig {
    ServerConfig {
        command: Some("mock-mcp".to_string()),
        always_on,
        ..Default::default()
    }
}

/// Build an rmcp tool with an empty object schema.
pub fn tool(name: &str, description: &str) -> Tool {
    let schema = serde_json::json!({"type": "object", "properties": {}})
        .as_object()
        .cloned()
        .unwrap();
    Tool::new(name.to_string(), description.to_string(), Arc::new(schema))
}

/// Build an rmcp prompt with just a name.
pub fn prompt(name: &str) -> Prompt {
    Prompt {
        name: name.to_string(),
        title: None,
        description: None,
        arguments: None,
        icons: None,
        meta: None,
    }
}

/// Build an rmcp resource with a raw URI.
pub fn resource(uri: &str) -> Resource {
    Resource {
        raw: RawResource {
            uri: uri.to_string(),
            name: uri.to_string(),
            title: None,
            description: None,
            mime_type: None,
            size: None,
            icons: None,
            meta: None,
        },
        annotations: None,
    }
}

/// A document store seeded with the given servers, backed by a temp dir.
pub fn store_with(servers: &[(&str, ServerConfig)]) -> (DocumentStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("servers.yaml");
    let mut doc = Document::default();
    for (name, config) in servers {
        doc.servers.insert(name.to_string(), config.clone());
    }
    std::fs::write(&path, serde_yaml_ng::to_string(&doc).unwrap()).unwrap();
    (DocumentStore::load(&path).unwrap(), dir)
}
