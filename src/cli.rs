use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "multigate",
    version,
    about = "Aggregating MCP proxy for multiple backend servers"
)]
pub struct Cli {
    /// Path to the servers document. Default: <config-dir>/multigate/servers.yaml
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Serve MCP over streamable HTTP on this address (e.g. 127.0.0.1:3900)
    /// instead of stdio. The administrative API is served on the same listener.
    #[arg(long)]
    pub listen: Option<String>,

    /// Bearer token guarding the administrative API. Falls back to the
    /// MULTIGATE_ADMIN_TOKEN environment variable.
    #[arg(long)]
    pub admin_token: Option<String>,

    /// Log filter (tracing env-filter syntax).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Default document location under the platform config directory.
pub fn default_document_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("multigate")
        .join("servers.yaml")
}
