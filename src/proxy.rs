//! The aggregated MCP surface: one server downstream, many backends upstream.
//! Routes qualified names, enforces the document's enable/disable policy, and
//! emits per-capability list_changed notifications on membership changes.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    model::*,
    service::{NotificationContext, Peer, RequestContext},
};
use tracing::{debug, info, warn};

use crate::backend::BackendManager;
use crate::backend::error::ProxyError;
use crate::catalog::{Catalog, qualified_name, split_qualified};
use crate::discovery;
use crate::document::{DocumentStore, ServerConfig, validate_backend_name};
use crate::rank::ToolRanker;

/// Write-once-per-run handle to the downstream session, used for
/// notifications. Emitters perform a non-blocking read and drop emissions when
/// no session is attached.
pub struct Notifier {
    peer: ArcSwapOption<Peer<RoleServer>>,
}

impl Notifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peer: ArcSwapOption::empty(),
        })
    }

    /// Capture the downstream session at run-start (or at initialize for HTTP
    /// sessions; the latest session wins).
    pub fn attach(&self, peer: Peer<RoleServer>) {
        self.peer.store(Some(Arc::new(peer)));
    }

    /// Clear at run-end.
    pub fn detach(&self) {
        self.peer.store(None);
    }

    /// Emit list_changed for each capability in the snapshot. Best-effort and
    /// non-blocking for the caller; skipped entirely when no session is live.
    pub fn list_changed(&self, caps: crate::backend::transport::CapabilitySnapshot) {
        let Some(peer) = self.peer.load_full() else {
            debug!("no downstream session, skipping list_changed");
            return;
        };
        tokio::spawn(async move {
            if caps.tools && let Err(e) = peer.notify_tool_list_changed().await {
                debug!(error = %e, "failed to emit tools/list_changed");
            }
            if caps.prompts && let Err(e) = peer.notify_prompt_list_changed().await {
                debug!(error = %e, "failed to emit prompts/list_changed");
            }
            if caps.resources && let Err(e) = peer.notify_resource_list_changed().await {
                debug!(error = %e, "failed to emit resources/list_changed");
            }
        });
    }
}

/// Map a typed error onto an MCP error-result. Backend-origin failures are
/// surfaced this way rather than as protocol-level errors.
fn error_result(err: &ProxyError) -> CallToolResult {
    CallToolResult::error(vec![Content::text(err.to_string())])
}

/// The MCP server exposed to the downstream client.
#[derive(Clone)]
pub struct ProxyServer {
    pub store: Arc<DocumentStore>,
    pub manager: Arc<BackendManager>,
    pub catalog: Arc<Catalog>,
    pub ranker: Arc<dyn ToolRanker>,
    pub notifier: Arc<Notifier>,
}

impl ProxyServer {
    pub fn new(
        store: Arc<DocumentStore>,
        manager: Arc<BackendManager>,
        catalog: Arc<Catalog>,
        ranker: Arc<dyn ToolRanker>,
    ) -> Self {
        Self {
            store,
            manager,
            catalog,
            ranker,
            notifier: Notifier::new(),
        }
    }

    /// All enabled, non-stale tools across declared backends, in `(backend
    /// insertion order, sorted tool name)` order, after the ranking extension.
    /// Schemas missing from the catalog are fetched live.
    pub async fn aggregate_tools(&self, fingerprint: &str) -> Vec<Tool> {
        let doc = self.store.snapshot().await;
        let mut out = Vec::new();

        for (backend, server) in &doc.servers {
            let visible: Vec<(&String, &crate::document::ToolPolicy)> = server
                .tools
                .iter()
                .filter(|(_, policy)| policy.enabled && !policy.stale)
                .collect();
            if visible.is_empty() {
                continue;
            }

            let missing = visible
                .iter()
                .any(|(tool, _)| self.catalog.tool(&qualified_name(backend, tool)).is_none());
            if missing {
                match self.manager.get_or_open(backend).await {
                    Ok(session) => {
                        self.manager.record_use(backend);
                        match session.list_tools().await {
                            Ok(tools) => self.catalog.store_tools(backend, &tools),
                            Err(e) => {
                                warn!(backend = %backend, error = %e, "live tool fetch failed")
                            }
                        }
                    }
                    Err(e) => warn!(backend = %backend, error = %e, "cannot open backend for tool metadata"),
                }
            }

            for (tool, policy) in visible {
                let qualified = qualified_name(backend, tool);
                match self.catalog.tool(&qualified) {
                    Some(spec) => out.push(spec.to_tool(&policy.description)),
                    None => out.push(Tool::new(
                        qualified,
                        policy.description.clone(),
                        Arc::new(JsonObject::new()),
                    )),
                }
            }
        }

        self.ranker.rank(out, fingerprint)
    }

    /// Resolve and forward one tool call. All failures come back as MCP
    /// error-results, annotated with the backend name.
    pub async fn dispatch_tool_call(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> CallToolResult {
        let Some((backend, tool)) = split_qualified(name) else {
            info!(tool = %name, "call for unqualified tool name");
            return error_result(&ProxyError::UnknownBackend(name.to_string()));
        };

        let doc = self.store.snapshot().await;
        let Some(server) = doc.servers.get(backend) else {
            info!(backend = %backend, "call for unknown backend");
            return error_result(&ProxyError::UnknownBackend(backend.to_string()));
        };
        if let Some(policy) = server.tools.get(tool)
            && (!policy.enabled || policy.stale)
        {
            return error_result(&ProxyError::ToolHidden {
                backend: backend.to_string(),
                tool: tool.to_string(),
            });
        }

        let session = match self.manager.get_or_open(backend).await {
            Ok(session) => session,
            Err(e) => {
                warn!(backend = %backend, error = %e, "failed to open backend for call");
                return error_result(&e);
            }
        };
        self.manager.record_use(backend);

        match session.call_tool(tool, arguments).await {
            Ok(result) => result,
            Err(e) => {
                warn!(backend = %backend, tool = %tool, error = %e, "forwarded call failed");
                // Mark the session for close so the next request reopens.
                self.manager.close(backend).await;
                error_result(&ProxyError::TransportFailed {
                    backend: backend.to_string(),
                    source: e,
                })
            }
        }
    }

    /// All prompts across declared backends, names qualified.
    pub async fn aggregate_prompts(&self) -> Vec<Prompt> {
        let doc = self.store.snapshot().await;
        let mut out = Vec::new();
        for backend in doc.servers.keys() {
            out.extend(self.catalog.prompts_for(backend));
        }
        out
    }

    pub async fn dispatch_get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult, McpError> {
        let Some((backend, prompt)) = split_qualified(name) else {
            return Err(McpError::invalid_params(
                format!("unknown prompt: {name}"),
                None,
            ));
        };
        if !self.store.snapshot().await.servers.contains_key(backend) {
            return Err(McpError::invalid_params(
                format!("unknown backend '{backend}'"),
                None,
            ));
        }

        let session = self
            .manager
            .get_or_open(backend)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        self.manager.record_use(backend);
        session
            .get_prompt(prompt, arguments)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))
    }

    /// All resources across declared backends. URIs are raw, never rewritten;
    /// routing uses the reverse index built at discovery time.
    pub async fn aggregate_resources(&self) -> Vec<Resource> {
        let doc = self.store.snapshot().await;
        let mut out = Vec::new();
        for backend in doc.servers.keys() {
            out.extend(self.catalog.resources_for(backend));
        }
        out
    }

    pub async fn dispatch_read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let Some(backend) = self.catalog.backend_for_resource(uri) else {
            return Err(McpError::invalid_params(
                format!("unknown resource URI: {uri}"),
                None,
            ));
        };

        let session = self
            .manager
            .get_or_open(&backend)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        self.manager.record_use(&backend);
        session
            .read_resource(uri)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))
    }

    /// Add a backend at runtime. The backend is registered lazily, optionally
    /// persisted, then discovered once (eagerly) so its capabilities are known
    /// and the right list_changed notifications can be emitted. It stays
    /// connected only when pinned.
    pub async fn register_backend(
        &self,
        name: &str,
        config: ServerConfig,
        persist: bool,
    ) -> anyhow::Result<()> {
        validate_backend_name(name)?;
        config.validate_endpoint(name)?;

        self.manager.register(name, config.clone());
        self.manager.mark_pinned(name, config.always_on);

        if persist {
            self.store
                .update(|doc| {
                    doc.servers
                        .entry(name.to_string())
                        .or_insert_with(|| config.clone());
                })
                .await;
        }

        discovery::discover_backend(&self.store, &self.manager, &self.catalog, name).await;

        if let Err(e) = self.store.save().await {
            warn!(error = %e, "failed to persist document after registration");
        }

        let caps = self.catalog.capabilities(name).unwrap_or_default();
        self.notifier.list_changed(caps);
        info!(backend = %name, "backend registered");
        Ok(())
    }

    /// Remove a backend at runtime: close any live session and its transport
    /// stack, drop the pending config, and (opt-in) remove the document entry.
    pub async fn unregister_backend(
        &self,
        name: &str,
        remove_from_document: bool,
    ) -> Result<(), ProxyError> {
        let declared = self.manager.is_registered(name)
            || self.store.snapshot().await.servers.contains_key(name);
        if !declared {
            return Err(ProxyError::UnknownBackend(name.to_string()));
        }

        let caps = self.catalog.capabilities(name).unwrap_or_default();
        self.manager.remove(name).await;
        self.catalog.remove_backend(name);

        if remove_from_document {
            self.store
                .update(|doc| {
                    doc.servers.shift_remove(name);
                })
                .await;
            if let Err(e) = self.store.save().await {
                warn!(error = %e, "failed to persist document after unregistration");
            }
        }

        self.notifier.list_changed(caps);
        info!(backend = %name, "backend unregistered");
        Ok(())
    }
}

impl ServerHandler for ProxyServer {
    fn get_info(&self) -> ServerInfo {
        // Tools are always advertised: dynamic registration can add a tool
        // backend at any time and the client must accept list_changed.
        let union = self.catalog.capability_union();
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(true),
                }),
                prompts: union.prompts.then_some(PromptsCapability {
                    list_changed: Some(true),
                }),
                resources: union.resources.then_some(ResourcesCapability {
                    subscribe: None,
                    list_changed: Some(true),
                }),
                ..Default::default()
            },
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "multigate aggregates many MCP backend servers behind one endpoint. \
                 Tools and prompts are exposed under qualified names of the form \
                 '<backend>::<name>'; resources keep their original URIs. \
                 Call tools with their fully qualified names."
                    .into(),
            ),
        }
    }

    fn on_initialized(
        &self,
        context: NotificationContext<RoleServer>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.notifier.attach(context.peer.clone());
        std::future::ready(())
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let fingerprint = context
            .peer
            .peer_info()
            .map(|client| client.client_info.name.to_string())
            .unwrap_or_default();
        async move {
            Ok(ListToolsResult {
                meta: None,
                next_cursor: None,
                tools: self.aggregate_tools(&fingerprint).await,
            })
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            Ok(self
                .dispatch_tool_call(request.name.as_ref(), request.arguments)
                .await)
        }
    }

    fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListPromptsResult, McpError>> + Send + '_ {
        async move {
            Ok(ListPromptsResult {
                meta: None,
                next_cursor: None,
                prompts: self.aggregate_prompts().await,
            })
        }
    }

    fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<GetPromptResult, McpError>> + Send + '_ {
        async move {
            self.dispatch_get_prompt(request.name.as_ref(), request.arguments)
                .await
        }
    }

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        async move {
            Ok(ListResourcesResult {
                meta: None,
                next_cursor: None,
                resources: self.aggregate_resources().await,
            })
        }
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        async move { self.dispatch_read_resource(request.uri.as_ref()).await }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ToolPolicy;
    use crate::rank::Passthrough;
    use crate::testutil::{MockFactory, prompt, resource, store_with, stdio_config, tool};

    struct Fixture {
        proxy: ProxyServer,
        factory: Arc<MockFactory>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(servers: &[(&str, ServerConfig)]) -> Fixture {
        let (store, dir) = store_with(servers);
        let store = Arc::new(store);
        let factory = MockFactory::new();
        let manager = BackendManager::new(Arc::clone(&factory) as _);
        let catalog = Catalog::new();
        let proxy = ProxyServer::new(
            Arc::clone(&store),
            manager,
            catalog,
            Arc::new(Passthrough::new(None)),
        );
        Fixture {
            proxy,
            factory,
            _dir: dir,
        }
    }

    async fn discovered_fixture(servers: &[(&str, ServerConfig)]) -> Fixture {
        let fx = fixture(servers).await;
        discovery::run_sweep(&fx.proxy.store, &fx.proxy.manager, &fx.proxy.catalog).await;
        fx
    }

    fn result_text(result: &CallToolResult) -> String {
        result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(t) => Some(t.text.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_list_tools_qualified_in_document_order() {
        let fx = fixture(&[
            ("alpha", stdio_config(true)),
            ("beta", stdio_config(false)),
        ])
        .await;
        fx.factory
            .set_tools("alpha", vec![tool("y", "why"), tool("x", "ex")]);
        fx.factory.set_tools("beta", vec![tool("z", "zed")]);
        discovery::run_sweep(&fx.proxy.store, &fx.proxy.manager, &fx.proxy.catalog).await;

        let tools = fx.proxy.aggregate_tools("client").await;
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, vec!["alpha::x", "alpha::y", "beta::z"]);
        assert_eq!(tools[0].description.as_deref(), Some("ex"));
    }

    #[tokio::test]
    async fn test_list_tools_hides_disabled_and_stale() {
        let fx = discovered_fixture(&[("alpha", stdio_config(false))]).await;
        fx.proxy
            .store
            .update(|doc| {
                let tools = &mut doc.servers.get_mut("alpha").unwrap().tools;
                tools.insert(
                    "off".to_string(),
                    ToolPolicy {
                        enabled: false,
                        stale: false,
                        description: String::new(),
                    },
                );
                tools.insert(
                    "gone".to_string(),
                    ToolPolicy {
                        enabled: true,
                        stale: true,
                        description: String::new(),
                    },
                );
                tools.insert(
                    "on".to_string(),
                    ToolPolicy {
                        enabled: true,
                        stale: false,
                        description: String::new(),
                    },
                );
            })
            .await;
        fx.factory.set_tools("alpha", vec![tool("on", "")]);

        let tools = fx.proxy.aggregate_tools("").await;
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, vec!["alpha::on"]);
    }

    #[tokio::test]
    async fn test_list_tools_fetches_missing_schema_live() {
        // Document knows the tool but the catalog is cold (no discovery ran).
        let mut config = stdio_config(false);
        config.tools.insert(
            "x".to_string(),
            ToolPolicy {
                enabled: true,
                stale: false,
                description: "cached desc".to_string(),
            },
        );
        let fx = fixture(&[("alpha", config)]).await;
        fx.factory.set_tools("alpha", vec![tool("x", "live desc")]);
        fx.proxy.manager.register("alpha", stdio_config(false));

        let tools = fx.proxy.aggregate_tools("").await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name.as_ref(), "alpha::x");
        assert_eq!(fx.factory.open_attempts(), 1);
        assert!(fx.proxy.catalog.tool("alpha::x").is_some());
    }

    #[tokio::test]
    async fn test_call_tool_routes_and_echoes() {
        let fx = discovered_fixture(&[("alpha", stdio_config(false))]).await;
        fx.factory.set_tools("alpha", vec![tool("x", "")]);

        let mut args = JsonObject::new();
        args.insert("n".to_string(), serde_json::json!(7));
        let result = fx.proxy.dispatch_tool_call("alpha::x", Some(args)).await;
        assert_eq!(result.is_error, Some(false));

        let echoed: serde_json::Value = serde_json::from_str(&result_text(&result)).unwrap();
        assert_eq!(echoed["backend"], "alpha");
        assert_eq!(echoed["tool"], "x");
        assert_eq!(echoed["args"]["n"], 7);
    }

    #[tokio::test]
    async fn test_call_tool_unknown_backend() {
        let fx = discovered_fixture(&[("alpha", stdio_config(false))]).await;

        let result = fx.proxy.dispatch_tool_call("ghost::x", None).await;
        assert_eq!(result.is_error, Some(true));
        assert!(result_text(&result).contains("unknown backend"));

        let result = fx.proxy.dispatch_tool_call("not-qualified", None).await;
        assert_eq!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn test_call_tool_hidden_by_policy() {
        let fx = discovered_fixture(&[("alpha", stdio_config(false))]).await;
        fx.proxy
            .store
            .update(|doc| {
                doc.servers.get_mut("alpha").unwrap().tools.insert(
                    "x".to_string(),
                    ToolPolicy {
                        enabled: false,
                        stale: false,
                        description: String::new(),
                    },
                );
            })
            .await;

        let result = fx.proxy.dispatch_tool_call("alpha::x", None).await;
        assert_eq!(result.is_error, Some(true));
        assert!(result_text(&result).contains("disabled or stale"));
        // Policy rejections never open a session.
        assert!(fx.proxy.manager.connected_names().is_empty());
    }

    #[tokio::test]
    async fn test_call_tool_lazy_open_and_reuse() {
        let fx = discovered_fixture(&[("beta", stdio_config(false))]).await;
        fx.factory.set_tools("beta", vec![tool("z", "")]);
        let opens_after_sweep = fx.factory.open_attempts();

        fx.proxy.dispatch_tool_call("beta::z", None).await;
        fx.proxy.dispatch_tool_call("beta::z", None).await;

        // One reopen for both calls; the session is reused.
        assert_eq!(fx.factory.open_attempts(), opens_after_sweep + 1);
        assert_eq!(fx.proxy.manager.connected_names(), vec!["beta".to_string()]);
    }

    #[tokio::test]
    async fn test_forward_failure_closes_session_for_reopen() {
        let fx = discovered_fixture(&[("alpha", stdio_config(false))]).await;
        fx.factory.set_tools("alpha", vec![tool("x", "")]);

        fx.factory.fail_calls(true);
        let result = fx.proxy.dispatch_tool_call("alpha::x", None).await;
        assert_eq!(result.is_error, Some(true));
        assert!(result_text(&result).contains("alpha"));
        // The session was marked for close; the backend is pending again.
        assert!(fx.proxy.manager.connected_names().is_empty());
        assert!(fx.proxy.manager.pending_names().contains(&"alpha".to_string()));

        fx.factory.fail_calls(false);
        let result = fx.proxy.dispatch_tool_call("alpha::x", None).await;
        assert_eq!(result.is_error, Some(false));
    }

    #[tokio::test]
    async fn test_prompts_qualified_and_routed() {
        let fx = fixture(&[("alpha", stdio_config(false))]).await;
        fx.factory.set_prompts("alpha", vec![prompt("summarize")]);
        discovery::run_sweep(&fx.proxy.store, &fx.proxy.manager, &fx.proxy.catalog).await;

        let prompts = fx.proxy.aggregate_prompts().await;
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].name, "alpha::summarize");

        let result = fx
            .proxy
            .dispatch_get_prompt("alpha::summarize", None)
            .await
            .unwrap();
        assert_eq!(result.description.as_deref(), Some("alpha:summarize"));

        assert!(fx.proxy.dispatch_get_prompt("nope", None).await.is_err());
        assert!(
            fx.proxy
                .dispatch_get_prompt("ghost::summarize", None)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_resources_raw_uris_and_reverse_routing() {
        let fx = fixture(&[("alpha", stdio_config(false)), ("beta", stdio_config(false))]).await;
        fx.factory.set_resources("alpha", vec![resource("file:///a.txt")]);
        fx.factory.set_resources("beta", vec![resource("file:///b.txt")]);
        discovery::run_sweep(&fx.proxy.store, &fx.proxy.manager, &fx.proxy.catalog).await;

        let resources = fx.proxy.aggregate_resources().await;
        let uris: Vec<&str> = resources.iter().map(|r| r.raw.uri.as_str()).collect();
        assert_eq!(uris, vec!["file:///a.txt", "file:///b.txt"]);

        let result = fx
            .proxy
            .dispatch_read_resource("file:///b.txt")
            .await
            .unwrap();
        match &result.contents[0] {
            ResourceContents::TextResourceContents { text, .. } => {
                assert!(text.contains("beta"));
            }
            other => panic!("unexpected contents: {other:?}"),
        }

        assert!(fx.proxy.dispatch_read_resource("file:///nope").await.is_err());
    }

    #[tokio::test]
    async fn test_register_backend_persists_and_discovers() {
        let fx = fixture(&[]).await;
        fx.factory.set_tools("gamma", vec![tool("g", "gee")]);

        fx.proxy
            .register_backend("gamma", stdio_config(false), true)
            .await
            .unwrap();

        let doc = fx.proxy.store.snapshot().await;
        let policy = doc.servers.get("gamma").unwrap().tools.get("g").unwrap();
        assert!(policy.enabled);
        assert!(fx.proxy.catalog.capabilities("gamma").unwrap().tools);
        // Lazily managed after the eager discovery pass.
        assert!(fx.proxy.manager.connected_names().is_empty());
        assert_eq!(fx.proxy.manager.pending_names(), vec!["gamma".to_string()]);
    }

    #[tokio::test]
    async fn test_register_backend_rejects_bad_names() {
        let fx = fixture(&[]).await;
        assert!(
            fx.proxy
                .register_backend("bad::name", stdio_config(false), true)
                .await
                .is_err()
        );
        assert!(
            fx.proxy
                .register_backend("ok", ServerConfig::default(), true)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_unregister_backend_closes_and_removes() {
        let fx = discovered_fixture(&[("alpha", stdio_config(true))]).await;
        assert_eq!(fx.proxy.manager.connected_names(), vec!["alpha".to_string()]);

        fx.proxy.unregister_backend("alpha", true).await.unwrap();

        assert!(fx.proxy.manager.connected_names().is_empty());
        assert!(!fx.proxy.manager.is_registered("alpha"));
        assert!(fx.proxy.store.snapshot().await.servers.is_empty());
        assert!(fx.proxy.catalog.capabilities("alpha").is_none());
        assert!(fx.factory.closed_count() >= 1);

        let err = fx.proxy.unregister_backend("alpha", true).await.unwrap_err();
        assert!(matches!(err, ProxyError::UnknownBackend(_)));
    }

    #[tokio::test]
    async fn test_unregister_opt_out_keeps_document_entry() {
        let fx = discovered_fixture(&[("alpha", stdio_config(false))]).await;
        fx.proxy.unregister_backend("alpha", false).await.unwrap();
        assert!(
            fx.proxy
                .store
                .snapshot()
                .await
                .servers
                .contains_key("alpha")
        );
        assert!(!fx.proxy.manager.is_registered("alpha"));
    }

    #[tokio::test]
    async fn test_ranker_truncation_applies() {
        let (store, _dir) = store_with(&[("alpha", stdio_config(false))]);
        let store = Arc::new(store);
        let factory = MockFactory::new();
        factory.set_tools("alpha", vec![tool("a", ""), tool("b", ""), tool("c", "")]);
        let manager = BackendManager::new(Arc::clone(&factory) as _);
        let catalog = Catalog::new();
        let proxy = ProxyServer::new(
            Arc::clone(&store),
            manager,
            catalog,
            Arc::new(Passthrough::new(Some(2))),
        );
        discovery::run_sweep(&proxy.store, &proxy.manager, &proxy.catalog).await;

        let tools = proxy.aggregate_tools("").await;
        assert_eq!(tools.len(), 2);
    }
}
