//! Route-server sessions: Telnet connections to BGP looking-glass hosts.
//!
//! Every failure is reported twice: as a structured result to the caller
//! and as a bracketed line in the session transcript.

use crate::config::{RouteServerConfig, TelnetLineEnding};
use crate::error::{ApiError, BridgeResult, ErrorCode};
use crate::session::telnet::{Inbox, TelnetConnection, TelnetOptions, WaitOutcome};
use crate::session::{OutputSink, SessionRecord, SessionRegistry, new_session_id, now_ms};
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl CommandResult {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
            error_code: None,
        }
    }

    fn failed(err: &ApiError) -> Self {
        Self {
            success: false,
            error: Some(err.describe()),
            error_code: Some(err.error_code.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DisconnectResult {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteServerSummary {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub state: SessionState,
    pub created_at: u64,
}

/// Compiled login and prompt patterns.
struct Prompts {
    password: Regex,
    shell: Regex,
    failed_login: Regex,
    pager: Option<Regex>,
}

impl Prompts {
    fn compile(config: &RouteServerConfig) -> BridgeResult<Self> {
        let pager = config
            .pager_prompt
            .as_deref()
            .filter(|pattern| !pattern.is_empty())
            .map(Regex::new)
            .transpose()?;
        Ok(Self {
            password: Regex::new(&config.password_prompt)?,
            shell: Regex::new(&config.shell_prompt)?,
            failed_login: Regex::new(&config.failed_login_pattern)?,
            pager,
        })
    }
}

pub struct RouteServerSession {
    id: String,
    host: String,
    port: u16,
    state: AtomicU8,
    connection: TelnetConnection,
    sink: OutputSink,
    exec_lock: Mutex<()>,
    created_at: u64,
}

impl RouteServerSession {
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Moves `from` to `to` only if no one else moved the state first.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn notice(&self, text: impl Into<String>) {
        self.sink.route_server(&self.id, text);
    }

    fn summary(&self) -> RouteServerSummary {
        RouteServerSummary {
            session_id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            state: self.state(),
            created_at: self.created_at,
        }
    }
}

#[async_trait]
impl SessionRecord for RouteServerSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn cleanup(&self) {
        self.set_state(SessionState::Closing);
        if let Err(err) = self.connection.close().await {
            tracing::debug!(session_id = %self.id, error = %err, "Close during shutdown failed");
        }
        self.set_state(SessionState::Closed);
    }
}

pub struct RouteServerManager {
    config: RouteServerConfig,
    prompts: Prompts,
    registry: Arc<SessionRegistry<RouteServerSession>>,
}

impl RouteServerManager {
    pub fn new(config: RouteServerConfig) -> BridgeResult<Self> {
        let prompts = Prompts::compile(&config)?;
        Ok(Self {
            config,
            prompts,
            registry: Arc::new(SessionRegistry::new("route-server")),
        })
    }

    pub fn config(&self) -> &RouteServerConfig {
        &self.config
    }

    /// Opens a Telnet session and logs in. Every byte the server sends
    /// reaches `sink` as it arrives, handshake included.
    pub async fn connect(&self, host: &str, port: Option<u16>, sink: OutputSink) -> ConnectResult {
        let host = host.trim();
        let port = port.unwrap_or(self.config.default_port);
        if host.is_empty() {
            return ConnectResult {
                success: false,
                session_id: None,
                error: Some(
                    ApiError::new(ErrorCode::InvalidArgument, "Host must not be empty").describe(),
                ),
            };
        }

        let id = new_session_id();
        sink.route_server(&id, format!("Connecting to {}:{}...\r\n", host, port));
        tracing::info!(session_id = %id, host = %host, port, "Connecting to route server");

        match self.establish(&id, host, port, sink.clone()).await {
            Ok(session) => {
                session.set_state(SessionState::Open);
                self.registry.register(id.clone(), session.clone()).await;
                self.watch_remote_close(session);
                sink.route_server(&id, "\r\n[Connection established]\r\n");
                tracing::info!(session_id = %id, host = %host, "Route server session open");
                ConnectResult {
                    success: true,
                    session_id: Some(id),
                    error: None,
                }
            }
            Err(err) => {
                let err = err.into_api();
                let message = err.describe();
                tracing::warn!(session_id = %id, host = %host, error = %message, "Route server connect failed");
                sink.route_server(&id, format!("\r\n[Connection failed: {}]\r\n", message));
                ConnectResult {
                    success: false,
                    session_id: None,
                    error: Some(message),
                }
            }
        }
    }

    async fn establish(
        &self,
        id: &str,
        host: &str,
        port: u16,
        sink: OutputSink,
    ) -> BridgeResult<Arc<RouteServerSession>> {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let deadline = Instant::now() + connect_timeout;
        let options = TelnetOptions {
            term: self.config.term.clone(),
            cols: self.config.cols,
            rows: self.config.rows,
            connect_timeout,
        };
        let forward_sink = sink.clone();
        let forward_id = id.to_string();
        let connection = TelnetConnection::open(host, port, options, move |text| {
            forward_sink.route_server(&forward_id, text);
        })
        .await?;

        if let Err(err) = self.login(&connection, deadline).await {
            if let Err(close_err) = connection.close().await {
                tracing::debug!(session_id = %id, error = %close_err, "Close after failed login");
            }
            return Err(err);
        }

        Ok(Arc::new(RouteServerSession {
            id: id.to_string(),
            host: host.to_string(),
            port,
            state: AtomicU8::new(SessionState::Connecting as u8),
            connection,
            sink,
            exec_lock: Mutex::new(()),
            created_at: now_ms(),
        }))
    }

    async fn login(&self, connection: &TelnetConnection, deadline: Instant) -> BridgeResult<()> {
        let inbox = connection.inbox();
        let mut password_sent = false;
        loop {
            let patterns = [
                &self.prompts.failed_login,
                &self.prompts.password,
                &self.prompts.shell,
            ];
            match inbox.wait_for(&patterns, deadline).await {
                WaitOutcome::Matched(0, _) => {
                    return Err(ApiError::new(ErrorCode::AuthFailed, "Authentication failed").into());
                }
                WaitOutcome::Matched(1, _) => {
                    if password_sent {
                        return Err(ApiError::new(
                            ErrorCode::AuthFailed,
                            "Password rejected by route server",
                        )
                        .into());
                    }
                    let Some(password) = self.config.password.as_deref() else {
                        return Err(ApiError::new(
                            ErrorCode::AuthFailed,
                            "Route server asked for a password but none is configured",
                        )
                        .into());
                    };
                    connection.send_text(&format!("{}\n", password), &self.config.line_ending)?;
                    password_sent = true;
                }
                WaitOutcome::Matched(_, _) => return Ok(()),
                WaitOutcome::Eof => {
                    return Err(ApiError::new(
                        ErrorCode::RemoteClosed,
                        "Connection closed during login",
                    )
                    .into());
                }
                WaitOutcome::TimedOut => {
                    return Err(ApiError::new(
                        ErrorCode::ConnectTimeout,
                        format!("Login timed out after {}ms", self.config.connect_timeout_ms),
                    )
                    .into());
                }
            }
        }
    }

    fn watch_remote_close(&self, session: Arc<RouteServerSession>) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            session.connection.closed().await;
            if session.transition(SessionState::Open, SessionState::Closed) {
                tracing::info!(session_id = %session.id, "Route server closed the connection");
                session.notice("\r\n[Connection closed by remote host]\r\n");
                registry.remove(&session.id).await;
            }
        });
    }

    /// Runs one command and waits for the next shell prompt. Commands on
    /// the same session run one at a time.
    pub async fn send_command(&self, session_id: &str, command: &str) -> CommandResult {
        let Some(session) = self.registry.get(session_id).await else {
            return CommandResult::failed(&not_found());
        };
        if session.state() != SessionState::Open {
            return CommandResult::failed(&not_found());
        }

        let _guard = session.exec_lock.lock().await;
        if session.state() != SessionState::Open {
            return CommandResult::failed(&not_found());
        }

        session.notice(format!("\n> {}\n", command));
        match self.exec(&session, command).await {
            Ok(()) => CommandResult::ok(),
            Err(err) => {
                let err = err.into_api();
                if err.error_code == ErrorCode::ExecTimeout {
                    tracing::warn!(session_id = %session.id, command = %command, "Route server command timed out");
                    session.notice(format!(
                        "\r\n[Command timed out after {}s]\r\n",
                        self.config.exec_timeout_ms / 1000
                    ));
                } else {
                    tracing::warn!(session_id = %session.id, error = %err, "Route server command failed");
                    session.notice(format!("\r\n[Command failed: {}]\r\n", err.describe()));
                }
                CommandResult::failed(&err)
            }
        }
    }

    async fn exec(&self, session: &RouteServerSession, command: &str) -> BridgeResult<()> {
        let inbox: &Inbox = session.connection.inbox();
        inbox.clear();
        let line_ending = &self.config.line_ending;
        session
            .connection
            .send_text(&format!("{}\n", command), line_ending)?;

        let deadline = Instant::now() + Duration::from_millis(self.config.exec_timeout_ms);
        loop {
            let outcome = match &self.prompts.pager {
                Some(pager) => inbox.wait_for(&[&self.prompts.shell, pager], deadline).await,
                None => inbox.wait_for(&[&self.prompts.shell], deadline).await,
            };
            match outcome {
                WaitOutcome::Matched(0, _) => return Ok(()),
                WaitOutcome::Matched(_, _) => {
                    session
                        .connection
                        .send_text(" ", &TelnetLineEnding::PassThrough)?;
                }
                WaitOutcome::Eof => {
                    return Err(ApiError::new(
                        ErrorCode::RemoteClosed,
                        "Connection closed by remote host",
                    )
                    .into());
                }
                WaitOutcome::TimedOut => {
                    return Err(ApiError::new(ErrorCode::ExecTimeout, "Command timed out").into());
                }
            }
        }
    }

    /// Closes the session. Succeeds for unknown and already closed ids.
    pub async fn disconnect(&self, session_id: &str) -> DisconnectResult {
        let Some(session) = self.registry.remove(session_id).await else {
            tracing::debug!(session_id = %session_id, "Disconnect for unknown session");
            return DisconnectResult { success: true };
        };

        if session.transition(SessionState::Open, SessionState::Closing) {
            session.notice("\r\n[Disconnecting...]\r\n");
            if let Err(err) = session.connection.close().await {
                tracing::debug!(session_id = %session.id, error = %err, "Close during disconnect failed");
            }
            session.set_state(SessionState::Closed);
            tracing::info!(session_id = %session.id, "Route server session disconnected");
        }
        DisconnectResult { success: true }
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<RouteServerSession>> {
        self.registry.get(session_id).await
    }

    pub async fn list(&self) -> Vec<RouteServerSummary> {
        let mut sessions: Vec<RouteServerSummary> = self
            .registry
            .records()
            .await
            .iter()
            .map(|session| session.summary())
            .collect();
        sessions.sort_by_key(|summary| summary.created_at);
        sessions
    }

    pub async fn shutdown(&self) -> usize {
        self.registry.remove_all().await
    }
}

fn not_found() -> ApiError {
    ApiError::new(ErrorCode::NotFound, "Session not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompts_match_route_server_output() {
        let prompts = Prompts::compile(&RouteServerConfig::default()).expect("compile");
        assert!(prompts.password.is_match("User Access Verification\r\n\r\nPassword: "));
        assert!(prompts.shell.is_match("\r\nroute-server> "));
        assert!(prompts.shell.is_match("router#"));
        assert!(!prompts.shell.is_match("BGP table version is 5\r\n"));
        assert!(prompts.shell.is_match("RP/0/RSP0/CPU0:edge#"));
        assert!(prompts.password.is_match("Password: "));
    }

    #[test]
    fn shell_prompt_ignores_bgp_table_markers() {
        let prompts = Prompts::compile(&RouteServerConfig::default()).expect("compile");
        // A read that stops right after a best-path marker.
        assert!(!prompts.shell.is_match("   Network          Next Hop\r\n*>"));
        assert!(!prompts.shell.is_match("*> 8.8.8.0/24      206.126.236.26\r\n*>i"));
        assert!(!prompts.shell.is_match("##########\r\n"));
        // The prompt must end the text received so far.
        assert!(!prompts.shell.is_match("route-server>\r\nBGP routing table entry"));
        assert!(prompts.shell.is_match("1.1.1.0/24\r\n\r\nroute-server> "));
        assert!(prompts.failed_login.is_match("% Login incorrect"));
        assert!(prompts.pager.as_ref().expect("pager").is_match(" --More-- "));
    }

    #[test]
    fn invalid_prompt_pattern_is_rejected() {
        let config = RouteServerConfig {
            shell_prompt: "[".to_string(),
            ..RouteServerConfig::default()
        };
        assert!(RouteServerManager::new(config).is_err());
    }

    #[test]
    fn results_serialize_camel_case() {
        let result = ConnectResult {
            success: true,
            session_id: Some("abc".to_string()),
            error: None,
        };
        assert_eq!(
            serde_json::to_value(&result).expect("json"),
            serde_json::json!({ "success": true, "sessionId": "abc" })
        );
        let failed = CommandResult::failed(&not_found());
        assert_eq!(
            serde_json::to_value(&failed).expect("json"),
            serde_json::json!({
                "success": false,
                "error": "Session not found",
                "errorCode": "NOT_FOUND"
            })
        );
    }

    #[tokio::test]
    async fn empty_host_is_rejected_without_output() {
        let manager = RouteServerManager::new(RouteServerConfig::default()).expect("manager");
        let (sink, mut rx) = OutputSink::channel();
        let result = manager.connect("   ", None, sink).await;
        assert!(!result.success);
        assert!(result.error.expect("error").contains("Host"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let manager = RouteServerManager::new(RouteServerConfig::default()).expect("manager");
        let result = manager.send_command("missing", "show ip bgp").await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Session not found"));
        assert!(manager.disconnect("missing").await.success);
    }
}
