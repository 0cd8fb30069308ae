//! Startup configuration: a single JSONC file, stripped of comments and
//! parsed strictly - unknown fields are rejected so a typo in the file
//! surfaces at load time instead of silently taking a default.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}:{column}: {message}")]
    Parse {
        path: String,
        line: usize,
        column: usize,
        message: String,
    },
}

/// Per-model entry in the configured model catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelEntry {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

/// One supported container type (the runtime image and resource defaults
/// a project selects by name).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerTypeEntry {
    pub image: String,
    #[serde(default)]
    pub default_cpu_limit: Option<f64>,
    #[serde(default)]
    pub default_memory_mb: Option<u64>,
}

/// Default recursion/fanout/cost limits applied to a project that doesn't
/// override them. Mirrors `ResourceLimitOverrides` but with all fields
/// mandatory, since these are the values overrides are merged onto.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultLimits {
    pub max_depth: u32,
    pub max_agents: u32,
    pub max_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerRetention {
    pub history_max_rows_per_target: u32,
    pub history_max_age_days: u32,
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_tmp_retention_secs() -> u64 {
    3600
}

fn default_session_retention_days() -> i64 {
    30
}

fn default_disk_warn_percent() -> f64 {
    80.0
}

fn default_disk_error_percent() -> f64 {
    95.0
}

/// Drives `oubliette-store`'s cleanup/backup watchdog: scratch-file
/// removal, terminal session pruning, and disk-usage sampling. Every field
/// but `projects_dir` has a documented default so an operator's JSONC
/// file only needs to override what it cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanupConfig {
    /// Root directory containing per-project workspace checkouts; scanned
    /// for orphan `*.tmp` files and sampled for disk usage.
    pub projects_dir: String,
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_tmp_retention_secs")]
    pub tmp_retention_secs: u64,
    #[serde(default = "default_session_retention_days")]
    pub session_retention_days: i64,
    #[serde(default = "default_disk_warn_percent")]
    pub disk_warn_percent: f64,
    #[serde(default = "default_disk_error_percent")]
    pub disk_error_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub server_address: String,
    /// Credential values by name, looked up at container-create time;
    /// never logged or returned to callers (see `project_options`).
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    pub default_limits: DefaultLimits,
    pub models: Vec<ModelEntry>,
    pub container_types: HashMap<String, ContainerTypeEntry>,
    pub scheduler_retention: SchedulerRetention,
    pub cleanup: CleanupConfig,
    /// SQLite file backing `oubliette-store`; defaults to
    /// `SqlitePool::default_location` when unset.
    #[serde(default)]
    pub database_path: Option<String>,
    /// Directory holding one Unix domain socket per project
    /// (`<relay_socket_dir>/<project_id>.sock`), mounted read-write into
    /// that project's container so its agent wrapper can dial back in.
    pub relay_socket_dir: String,
}

impl Config {
    /// Loads and strictly parses a JSONC file from disk.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let raw = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;
        Self::parse(&raw, &path_ref.display().to_string())
    }

    /// Strips `//` and `/* */` comments outside of string literals, then
    /// parses strictly. Parse errors report line/column against the
    /// *original* source so a dangling comma still points at the right
    /// place in the file the user edited.
    pub fn parse(source: &str, path: &str) -> Result<Self, ConfigError> {
        let stripped = strip_jsonc_comments(source);
        serde_json::from_str(&stripped).map_err(|e| {
            let (line, column) = locate(source, e.line(), e.column());
            ConfigError::Parse {
                path: path.to_string(),
                line,
                column,
                message: e.to_string(),
            }
        })
    }
}

/// Strips comments outside string literals, preserving line/column
/// positions by replacing comment bytes with spaces (newlines kept as
/// newlines) rather than removing them.
fn strip_jsonc_comments(source: &str) -> String {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            '/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    if bytes[i] == b'\n' {
                        out.push('\n');
                    } else {
                        out.push(' ');
                    }
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Since comment-stripping never removes a newline, line numbers from the
/// stripped source already match the original; only returned for clarity
/// at the call site.
fn locate(_original: &str, line: usize, column: usize) -> (usize, usize) {
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    {
        // top-level server bind address
        "server_address": "127.0.0.1:7417",
        "credentials": { "github": "ghp_example" /* inline */ },
        "default_limits": { "max_depth": 3, "max_agents": 50, "max_cost_usd": 10.0 },
        "models": [
            { "id": "claude-sonnet", "display_name": "Claude Sonnet", "extra_headers": {} }
        ],
        "container_types": {
            "default": { "image": "oubliette/agent:latest" }
        },
        "scheduler_retention": { "history_max_rows_per_target": 200, "history_max_age_days": 30 },
        "cleanup": { "projects_dir": "/var/lib/oubliette/projects" },
        "relay_socket_dir": "/var/lib/oubliette/relay"
    }
    "#;

    #[test]
    fn test_parses_sample_with_comments() {
        let config = Config::parse(SAMPLE, "sample.jsonc").unwrap();
        assert_eq!(config.server_address, "127.0.0.1:7417");
        assert_eq!(config.default_limits.max_depth, 3);
        assert_eq!(config.models.len(), 1);
        assert!(config.container_types.contains_key("default"));
    }

    #[test]
    fn test_rejects_unknown_field() {
        let with_typo = SAMPLE.replace("\"server_address\"", "\"server_addresss\"");
        let err = Config::parse(&with_typo, "sample.jsonc").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_strip_preserves_string_contents_with_slashes() {
        let src = r#"{"a": "http://example.com", "b": 1}"#;
        let stripped = strip_jsonc_comments(src);
        assert!(stripped.contains("http://example.com"));
    }

    #[test]
    fn test_strip_line_comment() {
        let src = "{\n  // comment\n  \"a\": 1\n}";
        let stripped = strip_jsonc_comments(src);
        let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_strip_block_comment_preserves_line_count() {
        let src = "{\n  /* multi\n     line */\n  \"a\": 1\n}";
        let stripped = strip_jsonc_comments(src);
        assert_eq!(src.lines().count(), stripped.lines().count());
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let err = Config::load_from_path("/nonexistent/oubliette.jsonc").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
