//! Extension point for the retrieval/ranking subsystem. The proxy hands the
//! ordered list of qualified tools plus a session fingerprint to a ranker,
//! which may reorder or filter it. The default is a passthrough.

use rmcp::model::Tool;

pub trait ToolRanker: Send + Sync {
    fn rank(&self, tools: Vec<Tool>, fingerprint: &str) -> Vec<Tool>;
}

/// Default ranker: keeps passthrough order `(backend insertion order, sorted
/// tool name)`, optionally capped by the document's `retrieval.max_tools`.
pub struct Passthrough {
    max_tools: Option<usize>,
}

impl Passthrough {
    pub fn new(max_tools: Option<usize>) -> Self {
        Self { max_tools }
    }
}

impl ToolRanker for Passthrough {
    fn rank(&self, mut tools: Vec<Tool>, _fingerprint: &str) -> Vec<Tool> {
        if let Some(max) = self.max_tools {
            tools.truncate(max);
        }
        tools
    }
}
