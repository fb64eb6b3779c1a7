use clap::Parser;
use netbridge::bridge::Bridge;
use netbridge::config::{self, Cli, Command, LookingGlassArgs, ShellsArgs};
use netbridge::error::{ApiError, BridgeResult, ErrorCode};
use netbridge::route_server::RouteServerManager;
use netbridge::session::shell::LaunchPlan;
use netbridge::session::{OutputSink, PushEvent};
use netbridge::terminal::TerminalManager;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::{Duration, timeout};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_server(args).await?,
        Command::Lg(args) => run_looking_glass(args).await?,
        Command::Shells(args) => run_shells(args)?,
    }
    Ok(())
}

async fn run_server(args: config::ServeArgs) -> BridgeResult<()> {
    let config = config::Config::load(&args)?;
    init_logging(&config.logging);

    let route_servers = Arc::new(RouteServerManager::new(config.route_server.clone())?);
    let terminals = Arc::new(TerminalManager::new(config.terminal.clone()));
    let bridge = Bridge::new(route_servers, terminals);
    tracing::info!(transport = ?config.server.transport, "netbridge starting");

    let listen = config.server.http.listen.clone();
    let auth_token = config.server.http.auth_token.clone();
    let result = match config.server.transport {
        config::Transport::Stdio => bridge.clone().serve_stdio().await,
        config::Transport::Http => {
            tokio::select! {
                res = bridge.clone().serve_http(&listen, &auth_token) => res,
                _ = tokio::signal::ctrl_c() => Ok(()),
            }
        }
        config::Transport::Both => {
            let stdio_task = tokio::spawn(bridge.clone().serve_stdio());
            let res = tokio::select! {
                res = bridge.clone().serve_http(&listen, &auth_token) => res,
                _ = tokio::signal::ctrl_c() => Ok(()),
            };
            stdio_task.abort();
            res
        }
    };

    bridge.shutdown().await;
    result
}

fn init_logging(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(logging.level.clone());
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run_looking_glass(args: LookingGlassArgs) -> BridgeResult<()> {
    let mut config = config::Config::load_with_env(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging);

    let manager = RouteServerManager::new(config.route_server.clone())?;
    let (sink, mut events) = OutputSink::channel();
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = events.recv().await {
            if let PushEvent::RouteServerOutput { data, .. } = event {
                if stdout.write_all(data.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        }
    });

    let host = args
        .host
        .unwrap_or_else(|| config.route_server.default_host.clone());
    let connected = manager.connect(&host, args.port, sink).await;
    let Some(session_id) = connected.session_id else {
        let _ = timeout(Duration::from_secs(1), printer).await;
        let message = connected.error.unwrap_or_else(|| "Connection failed".to_string());
        return Err(ApiError::new(ErrorCode::ConnectFailed, message).into());
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if matches!(command, "quit" | "exit") {
            break;
        }
        let result = manager.send_command(&session_id, command).await;
        if !result.success && manager.get(&session_id).await.is_none() {
            break;
        }
    }

    manager.disconnect(&session_id).await;
    drop(manager);
    let _ = timeout(Duration::from_secs(1), printer).await;
    Ok(())
}

fn run_shells(args: ShellsArgs) -> BridgeResult<()> {
    let config = config::Config::load_with_env(args.config.as_deref())?;
    let plan = LaunchPlan::resolve(&config.terminal, &[]);
    let report = json!({
        "platform": plan.platform,
        "arch": std::env::consts::ARCH,
        "shell": plan.shell.display().to_string(),
        "args": plan.args,
        "cwd": plan.cwd.display().to_string(),
        "path": plan.path_variable().map(|path| path.to_string_lossy()),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
