use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

/// Declarative description of one child server.
///
/// Two specs are equal iff `command`, `args`, and `env` are all equal —
/// this equality is what the reconfiguration controller uses to decide
/// whether a server actually changed on reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A validated `serverName -> ServerSpec` mapping. Never empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub servers: HashMap<String, ServerSpec>,
}

impl Config {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }
}

/// Read and validate the config document at `path`.
///
/// Requires a top-level object with a non-empty `mcpServers` field. For
/// each entry: `command` must be present and a string; `args`, if
/// present, must be an array of strings; `env`, if present, must be an
/// object of string to string. A missing `args`/`env` defaults to empty.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound(path.to_path_buf())
        } else {
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    parse(&text, path)
}

fn parse(text: &str, path: &Path) -> Result<Config, ConfigError> {
    let document: Value =
        serde_json::from_str(text).map_err(|source| ConfigError::InvalidSyntax {
            path: path.to_path_buf(),
            source,
        })?;

    let servers_value = document
        .get("mcpServers")
        .and_then(Value::as_object)
        .filter(|map| !map.is_empty())
        .ok_or(ConfigError::NoServers)?;

    let mut servers = HashMap::with_capacity(servers_value.len());
    for (name, entry) in servers_value {
        let spec = validate_server(name, entry)?;
        servers.insert(name.clone(), spec);
    }

    Ok(Config { servers })
}

fn validate_server(name: &str, entry: &Value) -> Result<ServerSpec, ConfigError> {
    let object = entry.as_object().ok_or_else(|| ConfigError::SchemaViolation {
        name: name.to_string(),
        reason: "server entry must be an object".to_string(),
    })?;

    let command = match object.get("command") {
        Some(Value::String(command)) if !command.is_empty() => command.clone(),
        Some(Value::String(_)) | None => {
            return Err(ConfigError::SchemaViolation {
                name: name.to_string(),
                reason: "requires 'command' field".to_string(),
            });
        }
        Some(_) => {
            return Err(ConfigError::SchemaViolation {
                name: name.to_string(),
                reason: "'command' must be a string".to_string(),
            });
        }
    };

    let args = match object.get("args") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ConfigError::SchemaViolation {
                        name: name.to_string(),
                        reason: "'args' must be an array of strings".to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(ConfigError::SchemaViolation {
                name: name.to_string(),
                reason: "'args' must be an array".to_string(),
            });
        }
    };

    let env = match object.get("env") {
        None => HashMap::new(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, value)| {
                value
                    .as_str()
                    .map(|value| (key.clone(), value.to_string()))
                    .ok_or_else(|| ConfigError::SchemaViolation {
                        name: name.to_string(),
                        reason: "'env' values must be strings".to_string(),
                    })
            })
            .collect::<Result<HashMap<_, _>, _>>()?,
        Some(_) => {
            return Err(ConfigError::SchemaViolation {
                name: name.to_string(),
                reason: "'env' must be an object".to_string(),
            });
        }
    };

    Ok(ServerSpec { command, args, env })
}
