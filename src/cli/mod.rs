//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `start` (default) -- start the media proxy
//! - `config show|get|path` -- inspect configuration
//! - `status` -- query a running instance's health endpoint
//! - `version` -- print build/version info

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::config;

/// Media delivery proxy.
#[derive(Parser, Debug)]
#[command(
    name = "media-proxy",
    version = env!("CARGO_PKG_VERSION"),
    about = "Allowlisted media proxy with on-demand image variants and byte-range video relay"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy (default when no subcommand is given).
    Start,

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Query a running instance for health information.
    Status {
        /// Port of the running instance (default: from config).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host of the running instance.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Print version, build date, and git commit information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration (secrets redacted) as JSON.
    Show,

    /// Print a specific configuration value by dot-notation path.
    Get {
        /// Dot-notation key (e.g. "server.port", "media.allowedOrigins").
        key: String,
    },

    /// Print the resolved configuration file path.
    Path,
}

// ---------------------------------------------------------------------------
// Subcommand handlers
// ---------------------------------------------------------------------------

/// Run the `config show` subcommand.
pub fn handle_config_show() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    println!("{}", serde_json::to_string_pretty(&config::redacted_json(&cfg))?);
    Ok(())
}

/// Run the `config get <key>` subcommand.
pub fn handle_config_get(key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    let value = get_value_at_path(&config::redacted_json(&cfg), key)
        .ok_or_else(|| format!("Key not found: {key}"))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Run the `config path` subcommand.
pub fn handle_config_path() {
    println!("{}", config::config_path().display());
}

/// Run the `status` subcommand -- connect to a running instance's health endpoint.
pub async fn handle_status(
    host: &str,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let port = match port {
        Some(port) => port,
        None => config::load_config()?.server.port,
    };
    let url = format!("http://{}:{}/health", host, port);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    let response = client.get(&url).send().await.map_err(|e| {
        format!("Could not connect to media-proxy at {host}:{port}: {e}\nIs the server running? Start it with: media-proxy start")
    })?;

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(format!("Health endpoint returned HTTP {status}: {text}").into());
    }
    let body: Value = serde_json::from_str(&text)?;

    println!("media-proxy status");
    println!("==================");
    if let Some(version) = body.get("version").and_then(|v| v.as_str()) {
        println!("  Version:  {}", version);
    }
    if let Some(uptime) = body.get("uptimeSeconds").and_then(|v| v.as_u64()) {
        println!("  Uptime:   {}", format_duration(uptime));
    }
    println!("  Address:  {}:{}", host, port);
    if let Some(status) = body.get("status").and_then(|v| v.as_str()) {
        println!("  Status:   {}", status);
    }
    Ok(())
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("media-proxy {}", env!("CARGO_PKG_VERSION"));
    println!("  Build date: {}", env!("MEDIA_PROXY_BUILD_DATE"));
    println!("  Git commit: {}", env!("MEDIA_PROXY_GIT_HASH"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Navigate a JSON value by dot-notation path and return the leaf value.
fn get_value_at_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current.clone())
}

/// Format seconds into a human-readable duration string.
fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_no_args_defaults_to_none() {
        let cli = Cli::try_parse_from(["media-proxy"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_start_subcommand() {
        let cli = Cli::try_parse_from(["media-proxy", "start"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Start)));
    }

    #[test]
    fn test_cli_version_subcommand() {
        let cli = Cli::try_parse_from(["media-proxy", "version"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Version)));
    }

    #[test]
    fn test_cli_config_show() {
        let cli = Cli::try_parse_from(["media-proxy", "config", "show"]).unwrap();
        match cli.command {
            Some(Command::Config(ConfigCommand::Show)) => {}
            other => panic!("Expected Config(Show), got {:?}", other),
        }
    }

    #[test]
    fn test_cli_config_get() {
        let cli = Cli::try_parse_from(["media-proxy", "config", "get", "server.port"]).unwrap();
        match cli.command {
            Some(Command::Config(ConfigCommand::Get { key })) => assert_eq!(key, "server.port"),
            other => panic!("Expected Config(Get), got {:?}", other),
        }
    }

    #[test]
    fn test_cli_config_path() {
        let cli = Cli::try_parse_from(["media-proxy", "config", "path"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Config(ConfigCommand::Path))
        ));
    }

    #[test]
    fn test_cli_status_defaults() {
        let cli = Cli::try_parse_from(["media-proxy", "status"]).unwrap();
        match cli.command {
            Some(Command::Status { port, host }) => {
                assert_eq!(port, None);
                assert_eq!(host, "127.0.0.1");
            }
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_status_with_port() {
        let cli = Cli::try_parse_from(["media-proxy", "status", "-p", "9090"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Status { port: Some(9090), .. })
        ));
    }

    #[test]
    fn test_get_value_at_path() {
        let root = serde_json::json!({"server": {"port": 8080}, "media": {"maxWidth": 3840}});
        assert_eq!(
            get_value_at_path(&root, "server.port"),
            Some(serde_json::json!(8080))
        );
        assert_eq!(get_value_at_path(&root, "server.missing"), None);
        assert_eq!(get_value_at_path(&root, "server.port.deeper"), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3 * 3600 + 61), "3h 1m 1s");
        assert_eq!(format_duration(2 * 86400 + 3600), "2d 1h 0m 0s");
    }
}
