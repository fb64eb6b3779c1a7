use crate::error::{ApiError, BridgeResult, ErrorCode};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "netbridge.toml";

#[derive(Debug, Clone, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum Transport {
    #[default]
    Stdio,
    Http,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum TelnetLineEnding {
    Cr,
    #[default]
    Crlf,
    Lf,
    PassThrough,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub server: ServerConfig,
    pub route_server: RouteServerConfig,
    pub terminal: TerminalConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: Transport,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen: String,
    pub auth_token: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8766".to_string(),
            auth_token: String::new(),
        }
    }
}

/// Login flow and timeouts for route-server sessions.
///
/// The defaults target the public Hurricane Electric route server, which
/// asks only for a password and answers with a `>` prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteServerConfig {
    pub default_host: String,
    pub default_port: u16,
    pub password: Option<String>,
    pub password_prompt: String,
    pub shell_prompt: String,
    pub failed_login_pattern: String,
    pub pager_prompt: Option<String>,
    pub connect_timeout_ms: u64,
    pub exec_timeout_ms: u64,
    pub line_ending: TelnetLineEnding,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

impl Default for RouteServerConfig {
    fn default() -> Self {
        Self {
            default_host: "route-server.he.net".to_string(),
            default_port: 23,
            password: Some("rviews".to_string()),
            password_prompt: r"(?i)password:\s*$".to_string(),
            // A hostname-like token ending the received text; `*>` route
            // markers inside BGP tables never qualify.
            shell_prompt: r"(?m)(?:^|\r)[^\s*>#]+[>#]\s*\z".to_string(),
            failed_login_pattern: r"(?i)(login incorrect|authentication failed|access denied)"
                .to_string(),
            pager_prompt: Some("--More--".to_string()),
            connect_timeout_ms: 20_000,
            exec_timeout_ms: 30_000,
            line_ending: TelnetLineEnding::Crlf,
            term: "vt100".to_string(),
            cols: 200,
            rows: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub shell: Option<String>,
    pub login_shell: bool,
    pub default_cols: u16,
    pub default_rows: u16,
    pub term: String,
    pub extra_path: Vec<String>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: None,
            login_shell: true,
            default_cols: 80,
            default_rows: 24,
            term: "xterm-256color".to_string(),
            extra_path: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version = crate::version::VERSION, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Serve the session bridge to a UI process.
    Serve(ServeArgs),
    /// Interactive route-server client on this terminal.
    Lg(LookingGlassArgs),
    /// Report the shell and environment a new terminal would get.
    Shells(ShellsArgs),
}

#[derive(Debug, Parser, Clone, Default)]
pub struct ServeArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub transport: Option<Transport>,
    #[arg(long)]
    pub http_listen: Option<String>,
    #[arg(long)]
    pub auth_token: Option<String>,
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Parser, Clone)]
pub struct LookingGlassArgs {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Parser, Clone)]
pub struct ShellsArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    pub fn load(args: &ServeArgs) -> BridgeResult<Self> {
        let mut config = Self::load_file(args.config.as_deref())?;
        config.apply_env();
        config.apply_cli(args);
        Ok(config)
    }

    /// Reads the explicit path, else `netbridge.toml` in the working
    /// directory, else defaults. Environment overrides are applied.
    pub fn load_with_env(path: Option<&Path>) -> BridgeResult<Self> {
        let mut config = Self::load_file(path)?;
        config.apply_env();
        Ok(config)
    }

    fn load_file(path: Option<&Path>) -> BridgeResult<Self> {
        if let Some(path) = path {
            Self::from_file(path)
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))
        } else {
            Ok(Self::default())
        }
    }

    fn from_file(path: &Path) -> BridgeResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to read config file")
                .with_details(err.to_string())
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> BridgeResult<Self> {
        let parsed: Self = toml::from_str(content).map_err(|err| {
            ApiError::new(ErrorCode::InvalidArgument, "Failed to parse config file")
                .with_details(err.to_string())
        })?;
        Ok(parsed)
    }

    fn apply_env(&mut self) {
        self.apply_vars(|key| env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(value) = var("NETBRIDGE_TRANSPORT")
            && let Some(transport) = parse_transport(&value)
        {
            self.server.transport = transport;
        }
        if let Some(value) = var("NETBRIDGE_HTTP_LISTEN") {
            self.server.http.listen = value;
        }
        if let Some(value) = var("NETBRIDGE_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = var("NETBRIDGE_ROUTE_SERVER_HOST")
            && !value.trim().is_empty()
        {
            self.route_server.default_host = value.trim().to_string();
        }
        if let Some(value) = var("NETBRIDGE_ROUTE_SERVER_PASSWORD") {
            self.route_server.password = if value.is_empty() { None } else { Some(value) };
        }
        if let Some(value) = var("NETBRIDGE_SHELL")
            && !value.trim().is_empty()
        {
            self.terminal.shell = Some(value.trim().to_string());
        }
    }

    fn apply_cli(&mut self, args: &ServeArgs) {
        if let Some(transport) = &args.transport {
            self.server.transport = transport.clone();
        }
        if let Some(listen) = &args.http_listen {
            self.server.http.listen = listen.clone();
        }
        if let Some(token) = &args.auth_token {
            self.server.http.auth_token = token.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }
}

fn parse_transport(value: &str) -> Option<Transport> {
    match value.to_ascii_lowercase().as_str() {
        "stdio" => Some(Transport::Stdio),
        "http" => Some(Transport::Http),
        "both" => Some(Transport::Both),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_target_public_route_server() {
        let config = Config::default();
        assert_eq!(config.route_server.default_host, "route-server.he.net");
        assert_eq!(config.route_server.default_port, 23);
        assert_eq!(config.route_server.password.as_deref(), Some("rviews"));
        assert_eq!(config.route_server.connect_timeout_ms, 20_000);
        assert_eq!(config.route_server.exec_timeout_ms, 30_000);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [route_server]
            default_host = "lg.example.net"
            line_ending = "cr"

            [terminal]
            shell = "/bin/sh"
            "#,
        )
        .expect("parse");
        assert_eq!(config.route_server.default_host, "lg.example.net");
        assert_eq!(config.route_server.line_ending, TelnetLineEnding::Cr);
        assert_eq!(config.route_server.default_port, 23);
        assert_eq!(config.terminal.shell.as_deref(), Some("/bin/sh"));
        assert!(config.terminal.login_shell);
    }

    #[test]
    fn invalid_toml_is_invalid_argument() {
        let err = Config::from_toml("[route_server]\ndefault_port = \"x\"").unwrap_err();
        match err {
            crate::error::BridgeError::Api(api) => {
                assert_eq!(api.error_code, ErrorCode::InvalidArgument)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn env_overrides_host_password_and_shell() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("NETBRIDGE_ROUTE_SERVER_HOST", " lg.example.org "),
            ("NETBRIDGE_ROUTE_SERVER_PASSWORD", ""),
            ("NETBRIDGE_SHELL", "/bin/dash"),
            ("NETBRIDGE_TRANSPORT", "HTTP"),
        ]);
        let mut config = Config::default();
        config.apply_vars(|key| vars.get(key).map(|value| value.to_string()));
        assert_eq!(config.route_server.default_host, "lg.example.org");
        assert!(config.route_server.password.is_none());
        assert_eq!(config.terminal.shell.as_deref(), Some("/bin/dash"));
        assert!(matches!(config.server.transport, Transport::Http));
    }

    #[test]
    fn reads_explicit_config_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        std::io::Write::write_all(
            &mut file,
            b"[server]\ntransport = \"http\"\n\n[terminal]\ndefault_cols = 132\n",
        )
        .expect("write config");
        let config = Config::from_file(file.path()).expect("load");
        assert!(matches!(config.server.transport, Transport::Http));
        assert_eq!(config.terminal.default_cols, 132);
        assert_eq!(config.terminal.default_rows, TerminalConfig::default().default_rows);
    }

    #[test]
    fn missing_config_file_is_io_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = Config::from_file(&dir.path().join("absent.toml")).unwrap_err();
        match err {
            crate::error::BridgeError::Api(api) => assert_eq!(api.error_code, ErrorCode::IoError),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cli_overrides_env() {
        let mut config = Config::default();
        config.apply_cli(&ServeArgs {
            transport: Some(Transport::Both),
            http_listen: Some("127.0.0.1:9000".to_string()),
            log_level: Some("debug".to_string()),
            ..ServeArgs::default()
        });
        assert!(matches!(config.server.transport, Transport::Both));
        assert_eq!(config.server.http.listen, "127.0.0.1:9000");
        assert_eq!(config.logging.level, "debug");
    }
}
