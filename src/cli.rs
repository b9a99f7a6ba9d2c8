//! Command-line surface. Thin by design — see `SPEC_FULL.md` §6: CLI
//! parsing is glue, not specified behavior, beyond the one validation
//! rule (`--config`/`--command` mutually exclusive, at least one
//! required).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "mcp-hub", about = "HTTP gateway for child MCP tool servers")]
pub struct Cli {
    /// Path to the `mcpServers` config document.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Single-server mode: run one ad-hoc command as the sole mounted
    /// server, named "default". Mutually exclusive with `--config`.
    /// Usage: `mcp-hub --command -- npx -y some-mcp-server`.
    #[arg(long, num_args = 0.., allow_hyphen_values = true, value_name = "CMD")]
    pub command: Option<Vec<String>>,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 3000)]
    pub port: u16,

    /// API key required by the auth middleware. Unset disables auth.
    #[arg(long)]
    pub api_key: Option<String>,

    /// Repeatable. Omitted entirely disables the CORS layer.
    #[arg(long = "cors-allow-origin")]
    pub cors_allow_origin: Vec<String>,

    #[arg(long, default_value = "/")]
    pub path_prefix: String,

    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Watch `--config` for changes and apply them live.
    #[arg(long)]
    pub hot_reload: bool,
}

impl Cli {
    /// Neither `--config` nor `--command` was given, or both were.
    pub fn validate(&self) -> Result<(), String> {
        match (&self.config, &self.command) {
            (None, None) => Err("one of --config or --command is required".to_string()),
            (Some(_), Some(_)) => Err("--config and --command are mutually exclusive".to_string()),
            _ => Ok(()),
        }
    }
}
