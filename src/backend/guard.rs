//! Pre-open hardening: SSRF checks for URL backends and environment
//! sanitization for subprocess backends. Both run before a config reaches the
//! transport factory.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::LazyLock;

use super::error::ProxyError;
use crate::document::ServerConfig;

/// Parent environment variables a child process may inherit. Everything else
/// is withheld; backend-specific variables come from the config's `env` map.
const INHERITED_ENV: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "SHELL", "LANG", "LC_ALL", "TERM", "TMPDIR",
];

static ENV_KEY_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// The allowlisted slice of the parent environment.
pub fn base_env() -> BTreeMap<String, String> {
    INHERITED_ENV
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| ((*key).to_string(), v)))
        .collect()
}

/// Drop env entries whose keys are not valid variable names. Values were
/// already coerced to strings at document parse time.
pub fn sanitize_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, _)| ENV_KEY_RE.is_match(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Expand `${VAR}` references in the connection fields of a config. Expansion
/// happens here, at open time, so secrets are never baked back into the saved
/// document.
pub fn expand_config(config: &ServerConfig) -> Result<ServerConfig> {
    let expand = |value: &str| -> Result<String> {
        shellexpand::env(value)
            .map(|s| s.into_owned())
            .with_context(|| format!("env var interpolation failed in '{value}'"))
    };

    let mut out = config.clone();
    if let Some(command) = &config.command {
        out.command = Some(expand(command)?);
    }
    out.args = config.args.iter().map(|a| expand(a)).collect::<Result<_>>()?;
    out.env = config
        .env
        .iter()
        .map(|(k, v)| Ok((k.clone(), expand(v)?)))
        .collect::<Result<_>>()?;
    if let Some(url) = &config.url {
        out.url = Some(expand(url)?);
    }
    Ok(out)
}

fn is_blocked_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_ip(IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
        }
    }
}

/// Reject a backend URL whose host resolves into a private, loopback, or
/// link-local range. Literal IPs are checked without a lookup.
pub async fn check_url(backend: &str, url: &str) -> Result<(), ProxyError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ProxyError::TransportFailed {
        backend: backend.to_string(),
        source: anyhow::anyhow!("invalid url '{url}': {e}"),
    })?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ProxyError::TransportFailed {
            backend: backend.to_string(),
            source: anyhow::anyhow!("url '{url}' has no host"),
        })?
        .trim_matches(['[', ']'])
        .to_string();
    let port = parsed.port_or_known_default().unwrap_or(443);

    let addrs: Vec<IpAddr> = if let Ok(literal) = host.parse::<IpAddr>() {
        vec![literal]
    } else {
        tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| ProxyError::TransportFailed {
                backend: backend.to_string(),
                source: anyhow::anyhow!("failed to resolve host '{host}': {e}"),
            })?
            .map(|sock| sock.ip())
            .collect()
    };

    if addrs.iter().any(|addr| is_blocked_ip(*addr)) {
        return Err(ProxyError::SsrfBlocked {
            backend: backend.to_string(),
            host,
        });
    }
    Ok(())
}
