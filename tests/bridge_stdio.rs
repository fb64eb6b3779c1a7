use serde_json::{Value, json};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdout, Command};
use tokio::time::{Duration, timeout};

async fn next_message(lines: &mut Lines<BufReader<ChildStdout>>) -> Value {
    let line = timeout(Duration::from_secs(10), lines.next_line())
        .await
        .expect("response in time")
        .expect("read stdout")
        .expect("stdout open");
    serde_json::from_str(&line).expect("json line")
}

/// Reads until the response with `id`, skipping notifications.
async fn response_for(lines: &mut Lines<BufReader<ChildStdout>>, id: i64) -> Value {
    loop {
        let message = next_message(lines).await;
        if message.get("id") == Some(&json!(id)) {
            return message;
        }
    }
}

#[tokio::test]
async fn stdio_answers_requests_and_unknown_sessions() -> Result<(), Box<dyn std::error::Error>> {
    let bin = env!("CARGO_BIN_EXE_netbridge");
    let mut child = Command::new(bin)
        .arg("serve")
        .arg("--transport")
        .arg("stdio")
        .arg("--log-level")
        .arg("error")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdin = child.stdin.take().expect("stdin");
    let mut lines = BufReader::new(child.stdout.take().expect("stdout")).lines();

    let requests = [
        json!({ "jsonrpc": "2.0", "id": 1, "method": "list-sessions", "params": {} }),
        json!({
            "jsonrpc": "2.0", "id": 2, "method": "send-route-server-command",
            "params": { "sessionId": "missing", "command": "show ip bgp 8.8.8.8" }
        }),
        json!({
            "jsonrpc": "2.0", "id": 3, "method": "disconnect-route-server",
            "params": { "sessionId": "missing" }
        }),
        json!({ "jsonrpc": "2.0", "id": 4, "method": "kill-terminal", "params": { "id": "missing" } }),
        json!({ "jsonrpc": "2.0", "id": 5, "method": "no-such-method" }),
    ];
    for request in &requests {
        stdin.write_all(format!("{}\n", request).as_bytes()).await?;
    }
    stdin.flush().await?;

    let listed = response_for(&mut lines, 1).await;
    assert_eq!(
        listed["result"],
        json!({ "routeServers": [], "terminals": [] })
    );

    let command = response_for(&mut lines, 2).await;
    assert_eq!(command["result"]["success"], json!(false));
    assert_eq!(command["result"]["error"], json!("Session not found"));

    let disconnect = response_for(&mut lines, 3).await;
    assert_eq!(disconnect["result"], json!({ "success": true }));

    let kill = response_for(&mut lines, 4).await;
    assert_eq!(kill["result"], json!(false));

    let unknown = response_for(&mut lines, 5).await;
    assert_eq!(unknown["error"]["code"], json!(-32601));

    drop(stdin);
    let status = timeout(Duration::from_secs(10), child.wait()).await??;
    assert!(status.success());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn stdio_streams_terminal_output_as_notifications() -> Result<(), Box<dyn std::error::Error>>
{
    let bin = env!("CARGO_BIN_EXE_netbridge");
    let mut child = Command::new(bin)
        .arg("serve")
        .arg("--transport")
        .arg("stdio")
        .arg("--log-level")
        .arg("error")
        .env("NETBRIDGE_SHELL", "/bin/sh")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdin = child.stdin.take().expect("stdin");
    let mut lines = BufReader::new(child.stdout.take().expect("stdout")).lines();

    let create = json!({
        "jsonrpc": "2.0", "id": 1, "method": "create-terminal",
        "params": { "cols": 80, "rows": 24 }
    });
    stdin.write_all(format!("{}\n", create).as_bytes()).await?;
    let created = response_for(&mut lines, 1).await;
    let id = created["result"]["id"].as_str().expect("terminal id").to_string();
    assert!(created["result"]["pid"].as_u64().expect("pid") > 0);

    // `echo $((700 + 7))`; the echoed input never contains the answer.
    let write = json!({
        "jsonrpc": "2.0", "id": 2, "method": "write-terminal",
        "params": { "id": id, "data": "ZWNobyAkKCg3MDAgKyA3KSkK", "encoding": "base64" }
    });
    stdin.write_all(format!("{}\n", write).as_bytes()).await?;

    let channel = format!("terminal-output-{}", id);
    let mut output = String::new();
    while !output.contains("707") {
        let message = next_message(&mut lines).await;
        if message["method"] == json!(channel) {
            output.push_str(message["params"].as_str().unwrap_or_default());
        }
    }

    let kill = json!({ "jsonrpc": "2.0", "id": 3, "method": "kill-terminal", "params": { "id": id } });
    stdin.write_all(format!("{}\n", kill).as_bytes()).await?;
    let exit_channel = format!("terminal-exit-{}", id);
    let mut killed = None;
    let mut exited = false;
    while killed.is_none() || !exited {
        let message = next_message(&mut lines).await;
        if message.get("id") == Some(&json!(3)) {
            killed = Some(message["result"].clone());
        } else if message["method"] == json!(exit_channel) {
            exited = true;
        }
    }
    assert_eq!(killed, Some(json!(true)));

    drop(stdin);
    let _ = timeout(Duration::from_secs(10), child.wait()).await?;
    Ok(())
}
