//! In-repo build configuration.
//!
//! Repos declare how they build in a `.cinch.toml`, `.cinch.yaml`/`.yml`,
//! or `.cinch.json` at the repository root. The three formats are
//! equivalent; everything is normalized through a JSON value tree before
//! validation so the same rules apply to all of them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CinchError, Result};
use crate::model::RefType;

/// Candidate config files, probed in order at the event's commit.
pub const CONFIG_FILENAMES: &[(&str, ConfigFormat)] = &[
    (".cinch.toml", ConfigFormat::Toml),
    (".cinch.yaml", ConfigFormat::Yaml),
    (".cinch.yml", ConfigFormat::Yaml),
    (".cinch.json", ConfigFormat::Json),
];

/// Text format of a config blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

/// Sidecar service started by the worker before the build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Container image.
    pub image: String,
    /// Environment passed to the service.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Override command.
    #[serde(default)]
    pub command: Option<String>,
    /// Readiness probe.
    #[serde(default)]
    pub healthcheck: Option<Healthcheck>,
}

/// Readiness probe for a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Healthcheck {
    /// Command run inside the service container.
    pub cmd: String,
    /// Probe timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Where the build container comes from. Resolved by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContainerSource {
    Image { value: String },
    Dockerfile { value: String },
    Devcontainer { value: String },
    Container { value: String },
}

/// Parsed and validated repo build configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoBuildConfig {
    /// Command run for branch pushes and pull requests.
    pub build: String,
    /// Command run for tag pushes.
    pub release: Option<String>,
    /// Job timeout in seconds; the server default applies when unset.
    pub timeout_secs: Option<u64>,
    /// Label tuples for targeted dispatch: OR across tuples, AND within.
    pub workers: Vec<Vec<String>>,
    /// Sidecar services, passed through to the worker.
    pub services: BTreeMap<String, ServiceSpec>,
    /// Build container source, passed through to the worker.
    pub container: Option<ContainerSource>,
}

impl RepoBuildConfig {
    /// Parse a config blob in the given format.
    pub fn parse(format: ConfigFormat, text: &str) -> Result<Self> {
        let value = match format {
            ConfigFormat::Toml => {
                let parsed: toml::Value = toml::from_str(text)
                    .map_err(|e| CinchError::Validation(format!("invalid TOML config: {}", e)))?;
                toml_to_json(parsed)
            }
            ConfigFormat::Yaml => serde_yaml::from_str::<serde_json::Value>(text)
                .map_err(|e| CinchError::Validation(format!("invalid YAML config: {}", e)))?,
            ConfigFormat::Json => serde_json::from_str(text)
                .map_err(|e| CinchError::Validation(format!("invalid JSON config: {}", e)))?,
        };

        Self::from_value(value)
    }

    /// The command to run for a ref type. Tag pushes without a `release`
    /// command produce no job.
    pub fn command_for(&self, ref_type: RefType) -> Option<&str> {
        match ref_type {
            RefType::Tag => self.release.as_deref(),
            RefType::Branch | RefType::PullRequest => Some(&self.build),
        }
    }

    fn from_value(value: serde_json::Value) -> Result<Self> {
        let map = match value {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(CinchError::Validation(format!(
                    "config root must be a table, got {}",
                    json_type_name(&other)
                )))
            }
        };

        // `build` is required; `command` is the accepted legacy spelling.
        let build = match (map.get("build"), map.get("command")) {
            (Some(v), _) => command_string("build", v)?,
            (None, Some(v)) => command_string("command", v)?,
            (None, None) => {
                return Err(CinchError::Validation(
                    "config is missing the required `build` key".to_string(),
                ))
            }
        };

        let release = match map.get("release") {
            Some(v) => Some(command_string("release", v)?),
            None => None,
        };

        let timeout_secs = match map.get("timeout") {
            Some(serde_json::Value::Number(n)) => {
                let secs = n.as_u64().ok_or_else(|| {
                    CinchError::Validation("`timeout` must be a positive duration".to_string())
                })?;
                Some(secs)
            }
            Some(serde_json::Value::String(s)) => Some(parse_duration_secs(s)?),
            Some(other) => {
                return Err(CinchError::Validation(format!(
                    "`timeout` must be a duration, got {}",
                    json_type_name(other)
                )))
            }
            None => None,
        };

        let workers = match map.get("workers") {
            Some(v) => parse_label_tuples(v)?,
            None => Vec::new(),
        };

        let services = match map.get("services") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| CinchError::Validation(format!("invalid `services`: {}", e)))?,
            None => BTreeMap::new(),
        };

        let container = parse_container_source(&map)?;

        Ok(Self {
            build,
            release,
            timeout_secs,
            workers,
            services,
            container,
        })
    }
}

/// Extract a command string, rejecting the classic unquoted-YAML footgun
/// where `build: true` arrives as a boolean instead of a command.
fn command_string(key: &str, value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
        serde_json::Value::String(_) => Err(CinchError::Validation(format!(
            "`{}` must be a non-empty command string",
            key
        ))),
        serde_json::Value::Bool(b) => Err(CinchError::Validation(format!(
            "`{}` parsed as the boolean literal `{}`; quote the command string",
            key, b
        ))),
        other => Err(CinchError::Validation(format!(
            "`{}` must be a command string, got {}",
            key,
            json_type_name(other)
        ))),
    }
}

/// `workers` accepts a flat list (one tuple) or a list of lists.
fn parse_label_tuples(value: &serde_json::Value) -> Result<Vec<Vec<String>>> {
    let items = value.as_array().ok_or_else(|| {
        CinchError::Validation("`workers` must be a list of labels or label tuples".to_string())
    })?;

    if items.is_empty() {
        return Ok(Vec::new());
    }

    // Flat form: every element is a string.
    if items.iter().all(|v| v.is_string()) {
        let tuple = items
            .iter()
            .map(|v| v.as_str().unwrap_or_default().to_string())
            .collect();
        return Ok(vec![tuple]);
    }

    // Nested form: every element is a list of strings.
    let mut tuples = Vec::with_capacity(items.len());
    for item in items {
        let labels = item.as_array().ok_or_else(|| {
            CinchError::Validation(
                "`workers` entries must all be labels or all be label tuples".to_string(),
            )
        })?;
        let mut tuple = Vec::with_capacity(labels.len());
        for label in labels {
            let s = label.as_str().ok_or_else(|| {
                CinchError::Validation("`workers` labels must be strings".to_string())
            })?;
            tuple.push(s.to_string());
        }
        tuples.push(tuple);
    }
    Ok(tuples)
}

fn parse_container_source(
    map: &serde_json::Map<String, serde_json::Value>,
) -> Result<Option<ContainerSource>> {
    let mut found = Vec::new();
    for key in ["image", "dockerfile", "devcontainer", "container"] {
        if let Some(value) = map.get(key) {
            let s = value.as_str().ok_or_else(|| {
                CinchError::Validation(format!("`{}` must be a string", key))
            })?;
            found.push((key, s.to_string()));
        }
    }

    match found.len() {
        0 => Ok(None),
        1 => {
            let (key, value) = found.remove(0);
            Ok(Some(match key {
                "image" => ContainerSource::Image { value },
                "dockerfile" => ContainerSource::Dockerfile { value },
                "devcontainer" => ContainerSource::Devcontainer { value },
                _ => ContainerSource::Container { value },
            }))
        }
        _ => Err(CinchError::Validation(format!(
            "config declares multiple container sources: {}",
            found
                .iter()
                .map(|(k, _)| *k)
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Parse durations like `"90"`, `"45s"`, `"30m"`, `"1h"`, or `"1h30m"`.
pub fn parse_duration_secs(input: &str) -> Result<u64> {
    let s = input.trim();
    if s.is_empty() {
        return Err(CinchError::Validation("empty duration".to_string()));
    }

    // Bare integer means seconds.
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(secs);
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(CinchError::Validation(format!(
                "invalid duration `{}`",
                input
            )));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| CinchError::Validation(format!("invalid duration `{}`", input)))?;
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => {
                return Err(CinchError::Validation(format!(
                    "invalid duration unit `{}` in `{}`",
                    c, input
                )))
            }
        };
        total = total.saturating_add(value.saturating_mul(unit));
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(CinchError::Validation(format!(
            "duration `{}` has a trailing number without a unit",
            input
        )));
    }

    Ok(total)
}

/// Convert a TOML value tree into the common JSON representation.
fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "a list",
        serde_json::Value::Object(_) => "a table",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml() {
        let config = RepoBuildConfig::parse(ConfigFormat::Toml, r#"build = "cargo test""#).unwrap();
        assert_eq!(config.build, "cargo test");
        assert!(config.release.is_none());
        assert!(config.workers.is_empty());
    }

    #[test]
    fn test_yaml_boolean_build_footgun() {
        // Unquoted `true` in YAML is a boolean, not a command.
        let err = RepoBuildConfig::parse(ConfigFormat::Yaml, "build: true").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("boolean literal `true`"), "{}", message);
        assert!(message.contains("quote"), "{}", message);
    }

    #[test]
    fn test_toml_boolean_build_footgun() {
        let err = RepoBuildConfig::parse(ConfigFormat::Toml, "build = false").unwrap_err();
        assert!(err.to_string().contains("boolean literal `false`"));
    }

    #[test]
    fn test_missing_build_rejected() {
        let err = RepoBuildConfig::parse(ConfigFormat::Yaml, "release: make dist").unwrap_err();
        assert!(err.to_string().contains("required `build`"));
    }

    #[test]
    fn test_legacy_command_key() {
        let config = RepoBuildConfig::parse(ConfigFormat::Yaml, "command: make check").unwrap();
        assert_eq!(config.build, "make check");
    }

    #[test]
    fn test_full_yaml() {
        let text = r#"
build: cargo test --all
release: cargo publish
timeout: 45m
workers:
  - [linux, gpu]
  - [macos]
services:
  postgres:
    image: postgres:16
    env:
      POSTGRES_PASSWORD: ci
    healthcheck:
      cmd: pg_isready
      timeout_secs: 30
"#;
        let config = RepoBuildConfig::parse(ConfigFormat::Yaml, text).unwrap();
        assert_eq!(config.build, "cargo test --all");
        assert_eq!(config.release.as_deref(), Some("cargo publish"));
        assert_eq!(config.timeout_secs, Some(45 * 60));
        assert_eq!(config.workers, vec![
            vec!["linux".to_string(), "gpu".to_string()],
            vec!["macos".to_string()],
        ]);
        let postgres = &config.services["postgres"];
        assert_eq!(postgres.image, "postgres:16");
        assert_eq!(postgres.healthcheck.as_ref().unwrap().cmd, "pg_isready");
    }

    #[test]
    fn test_flat_workers_list_is_one_tuple() {
        let config =
            RepoBuildConfig::parse(ConfigFormat::Yaml, "build: make\nworkers: [gpu, linux]")
                .unwrap();
        assert_eq!(
            config.workers,
            vec![vec!["gpu".to_string(), "linux".to_string()]]
        );
    }

    #[test]
    fn test_json_format() {
        let text = r#"{"build": "npm test", "timeout": 120}"#;
        let config = RepoBuildConfig::parse(ConfigFormat::Json, text).unwrap();
        assert_eq!(config.build, "npm test");
        assert_eq!(config.timeout_secs, Some(120));
    }

    #[test]
    fn test_command_for_ref_types() {
        let config = RepoBuildConfig::parse(
            ConfigFormat::Yaml,
            "build: make check\nrelease: make dist",
        )
        .unwrap();
        assert_eq!(config.command_for(RefType::Branch), Some("make check"));
        assert_eq!(config.command_for(RefType::PullRequest), Some("make check"));
        assert_eq!(config.command_for(RefType::Tag), Some("make dist"));

        let no_release = RepoBuildConfig::parse(ConfigFormat::Yaml, "build: make").unwrap();
        assert_eq!(no_release.command_for(RefType::Tag), None);
    }

    #[test]
    fn test_container_sources() {
        let config =
            RepoBuildConfig::parse(ConfigFormat::Yaml, "build: make\nimage: rust:1.80").unwrap();
        assert_eq!(
            config.container,
            Some(ContainerSource::Image {
                value: "rust:1.80".to_string()
            })
        );

        let err = RepoBuildConfig::parse(
            ConfigFormat::Yaml,
            "build: make\nimage: rust:1.80\ndockerfile: ./Dockerfile",
        )
        .unwrap_err();
        assert!(err.to_string().contains("multiple container sources"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_secs("90").unwrap(), 90);
        assert_eq!(parse_duration_secs("45s").unwrap(), 45);
        assert_eq!(parse_duration_secs("30m").unwrap(), 1800);
        assert_eq!(parse_duration_secs("1h30m").unwrap(), 5400);
        assert_eq!(parse_duration_secs("1d").unwrap(), 86400);
        assert!(parse_duration_secs("").is_err());
        assert!(parse_duration_secs("fast").is_err());
        assert!(parse_duration_secs("10x").is_err());
    }
}
