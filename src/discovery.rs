//! Discovery orchestration: connect to each declared backend briefly,
//! enumerate what it exposes, fold tools through the merge engine, then
//! disconnect unless the backend is pinned.

use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::BackendManager;
use crate::backend::transport::CapabilitySnapshot;
use crate::catalog::Catalog;
use crate::document::DocumentStore;
use crate::merge::{self, ObservedTool};

/// Run one discovery pass over every backend declared in the document, in
/// insertion order, then persist the merged document. A per-backend failure is
/// recorded as an empty result; the sweep never aborts.
pub async fn run_sweep(
    store: &Arc<DocumentStore>,
    manager: &Arc<BackendManager>,
    catalog: &Arc<Catalog>,
) {
    let doc = store.snapshot().await;
    for (name, config) in &doc.servers {
        manager.register(name, config.clone());
        discover_backend(store, manager, catalog, name).await;
    }

    if let Err(e) = store.save().await {
        warn!(error = %e, "failed to persist document after discovery");
    }

    info!(
        backends = doc.servers.len(),
        tools = catalog.tool_count(),
        connected = manager.connected_names().len(),
        "discovery sweep complete"
    );
}

/// Discover one registered backend: open, snapshot capabilities, enumerate
/// tools/prompts/resources, merge tools into the document, close unless
/// pinned. Returns the number of tools observed.
pub async fn discover_backend(
    store: &Arc<DocumentStore>,
    manager: &Arc<BackendManager>,
    catalog: &Arc<Catalog>,
    name: &str,
) -> usize {
    let session = match manager.get_or_open(name).await {
        Ok(session) => session,
        Err(e) => {
            warn!(backend = %name, error = %e, "discovery failed, recording empty result");
            catalog.set_capabilities(name, CapabilitySnapshot::default());
            return 0;
        }
    };

    let caps = session.capabilities();
    catalog.set_capabilities(name, caps);

    let mut tool_count = 0;
    if caps.tools {
        match session.list_tools().await {
            Ok(tools) => {
                tool_count = tools.len();
                let observed: Vec<ObservedTool> = tools
                    .iter()
                    .map(|t| ObservedTool {
                        name: t.name.to_string(),
                        description: t.description.as_deref().unwrap_or_default().to_string(),
                    })
                    .collect();
                store
                    .update(|doc| *doc = merge::merge_observation(doc, name, &observed))
                    .await;
                catalog.store_tools(name, &tools);
            }
            Err(e) => warn!(backend = %name, error = %e, "tool enumeration failed"),
        }
    }

    if caps.prompts {
        match session.list_prompts().await {
            Ok(prompts) => catalog.store_prompts(name, prompts),
            Err(e) => warn!(backend = %name, error = %e, "prompt enumeration failed"),
        }
    }

    if caps.resources {
        match session.list_resources().await {
            Ok(resources) => catalog.store_resources(name, resources),
            Err(e) => warn!(backend = %name, error = %e, "resource enumeration failed"),
        }
    }

    info!(backend = %name, tools = tool_count, "backend discovered");

    if !manager.is_pinned(name) {
        manager.close(name).await;
    }

    tool_count
}
