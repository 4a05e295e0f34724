//! Runtime-only catalog of what each backend exposes: tool schemas, prompts,
//! resources, and the capability snapshot taken at initialize time. Rebuilt by
//! discovery; never persisted. The document owns policy, the catalog owns
//! metadata.

use dashmap::DashMap;
use rmcp::model::{Prompt, Resource, Tool};
use serde_json::Value;
use std::sync::Arc;

use crate::backend::transport::CapabilitySnapshot;

/// Separator between a backend name and a backend-local identifier. Backend
/// names cannot contain it, so splitting on the first occurrence is lossless.
pub const NAME_SEPARATOR: &str = "::";

/// Build the exposed `backend::tool` identifier.
pub fn qualified_name(backend: &str, local: &str) -> String {
    format!("{backend}{NAME_SEPARATOR}{local}")
}

/// Split an exposed identifier back into (backend, local).
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAME_SEPARATOR)
}

/// Cached metadata for one exposed tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub backend: String,
    pub local_name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSpec {
    /// Render as an exposed rmcp tool under the qualified name. The document
    /// description wins; the observed one fills in when the document has none.
    pub fn to_tool(&self, description: &str) -> Tool {
        let description = if description.is_empty() {
            self.description.clone()
        } else {
            description.to_string()
        };
        let schema = self.input_schema.as_object().cloned().unwrap_or_default();
        Tool::new(
            qualified_name(&self.backend, &self.local_name),
            description,
            Arc::new(schema),
        )
    }
}

/// Concurrent catalog aggregating metadata from all backends.
pub struct Catalog {
    /// qualified name -> spec
    tools: DashMap<String, ToolSpec>,
    /// backend -> qualified tool names
    backend_tools: DashMap<String, Vec<String>>,
    /// backend -> prompts (names already qualified)
    prompts: DashMap<String, Vec<Prompt>>,
    /// backend -> resources (raw URIs, never rewritten)
    resources: DashMap<String, Vec<Resource>>,
    /// reverse index: resource URI -> backend
    resource_index: DashMap<String, String>,
    capabilities: DashMap<String, CapabilitySnapshot>,
}

impl Catalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tools: DashMap::new(),
            backend_tools: DashMap::new(),
            prompts: DashMap::new(),
            resources: DashMap::new(),
            resource_index: DashMap::new(),
            capabilities: DashMap::new(),
        })
    }

    /// Replace the cached tool set for a backend.
    pub fn store_tools(&self, backend: &str, tools: &[Tool]) {
        if let Some((_, old)) = self.backend_tools.remove(backend) {
            for name in old {
                self.tools.remove(&name);
            }
        }

        let mut names = Vec::with_capacity(tools.len());
        for tool in tools {
            let qualified = qualified_name(backend, &tool.name);
            let spec = ToolSpec {
                backend: backend.to_string(),
                local_name: tool.name.to_string(),
                description: tool
                    .description
                    .as_deref()
                    .unwrap_or_default()
                    .to_string(),
                input_schema: serde_json::to_value(&tool.input_schema)
                    .unwrap_or(Value::Object(Default::default())),
            };
            self.tools.insert(qualified.clone(), spec);
            names.push(qualified);
        }
        self.backend_tools.insert(backend.to_string(), names);
    }

    /// Replace the cached prompts for a backend, qualifying each name.
    pub fn store_prompts(&self, backend: &str, mut prompts: Vec<Prompt>) {
        for prompt in prompts.iter_mut() {
            prompt.name = qualified_name(backend, &prompt.name);
        }
        self.prompts.insert(backend.to_string(), prompts);
    }

    /// Replace the cached resources for a backend and rebuild its slice of the
    /// reverse URI index.
    pub fn store_resources(&self, backend: &str, resources: Vec<Resource>) {
        if let Some((_, old)) = self.resources.remove(backend) {
            for resource in old {
                self.resource_index.remove(&resource.raw.uri);
            }
        }
        for resource in &resources {
            self.resource_index
                .insert(resource.raw.uri.clone(), backend.to_string());
        }
        self.resources.insert(backend.to_string(), resources);
    }

    pub fn set_capabilities(&self, backend: &str, caps: CapabilitySnapshot) {
        self.capabilities.insert(backend.to_string(), caps);
    }

    pub fn capabilities(&self, backend: &str) -> Option<CapabilitySnapshot> {
        self.capabilities.get(backend).map(|c| *c.value())
    }

    /// Union of capabilities across all known backends.
    pub fn capability_union(&self) -> CapabilitySnapshot {
        let mut union = CapabilitySnapshot::default();
        for entry in self.capabilities.iter() {
            union.tools |= entry.value().tools;
            union.prompts |= entry.value().prompts;
            union.resources |= entry.value().resources;
        }
        union
    }

    pub fn tool(&self, qualified: &str) -> Option<ToolSpec> {
        self.tools.get(qualified).map(|t| t.value().clone())
    }

    pub fn prompts_for(&self, backend: &str) -> Vec<Prompt> {
        self.prompts
            .get(backend)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    pub fn resources_for(&self, backend: &str) -> Vec<Resource> {
        self.resources
            .get(backend)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn backend_for_resource(&self, uri: &str) -> Option<String> {
        self.resource_index.get(uri).map(|b| b.value().clone())
    }

    /// Drop everything known about a backend.
    pub fn remove_backend(&self, backend: &str) {
        if let Some((_, names)) = self.backend_tools.remove(backend) {
            for name in names {
                self.tools.remove(&name);
            }
        }
        self.prompts.remove(backend);
        if let Some((_, resources)) = self.resources.remove(backend) {
            for resource in resources {
                self.resource_index.remove(&resource.raw.uri);
            }
        }
        self.capabilities.remove(backend);
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}
