//! Merge engine: reconcile a freshly discovered tool list with the persisted
//! document while preserving user decisions.
//!
//! The merge is pure and total. Discovery only ever touches `stale` and
//! `description`; `enabled` is owned by the user (document edits) and by
//! explicit administrative commands.

use crate::document::{Document, ToolPolicy};

/// A tool as observed by one discovery pass.
#[derive(Debug, Clone)]
pub struct ObservedTool {
    pub name: String,
    pub description: String,
}

/// Fold one backend's discovery observation into the document.
///
/// - observed, not in document: inserted with `enabled=true`, `stale=false`
/// - observed, already in document: `enabled` kept, `stale` cleared, description refreshed
/// - in document, not observed: marked `stale=true`, `enabled` preserved
///
/// A backend name absent from the document leaves it untouched.
pub fn merge_observation(doc: &Document, backend: &str, observed: &[ObservedTool]) -> Document {
    let mut out = doc.clone();
    let Some(server) = out.servers.get_mut(backend) else {
        return out;
    };

    for tool in observed {
        server
            .tools
            .entry(tool.name.clone())
            .and_modify(|policy| {
                policy.stale = false;
                policy.description = tool.description.clone();
            })
            .or_insert_with(|| ToolPolicy {
                enabled: true,
                stale: false,
                description: tool.description.clone(),
            });
    }

    for (name, policy) in server.tools.iter_mut() {
        if !observed.iter().any(|t| &t.name == name) {
            policy.stale = true;
        }
    }

    out
}

/// Remove every tool entry that is both stale and disabled, across all
/// backends. Runs only on explicit administrative request, never as part of a
/// discovery sweep. Returns the pruned document and the number of removals.
pub fn prune_stale_disabled(doc: &Document) -> (Document, usize) {
    let mut out = doc.clone();
    let mut removed = 0;
    for server in out.servers.values_mut() {
        let before = server.tools.len();
        server.tools.retain(|_, policy| policy.enabled || !policy.stale);
        removed += before - server.tools.len();
    }
    (out, removed)
}
