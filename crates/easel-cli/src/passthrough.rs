//! stdin/stdout JSON-lines front for a [`Bridge`].
//!
//! Input, one call per line:
//! `{"command": "layer.set_opacity", "params": {...}, "timeoutMs": 5000}`
//!
//! Output, one line per call in completion order: the `Response` object, or
//! `{"error": {"kind": "...", "message": "..."}}` when the call failed at the
//! transport level. Calls run concurrently.

use std::time::Duration;

use easel::Bridge;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallLine {
    command: String,
    #[serde(default = "empty_params")]
    params: serde_json::Value,
    timeout_ms: Option<u64>,
}

fn empty_params() -> serde_json::Value {
    json!({})
}

fn error_line(kind: &str, message: impl std::fmt::Display) -> String {
    json!({"error": {"kind": kind, "message": message.to_string()}}).to_string()
}

/// Run one input line through `bridge` and render the output line.
async fn handle_line(bridge: &Bridge, line: &str) -> String {
    let call: CallLine = match serde_json::from_str(line) {
        Ok(call) => call,
        Err(e) => return error_line("invalid_input", e),
    };
    let timeout = call
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(bridge.config().request_timeout);

    match bridge
        .send_with_timeout(&call.command, call.params, timeout)
        .await
    {
        Ok(response) => match serde_json::to_string(&response) {
            Ok(line) => line,
            Err(e) => error_line("encode", e),
        },
        Err(e) => error_line(e.kind(), e),
    }
}

/// Forward stdin lines until EOF or `shutdown`, then wait for in-flight calls.
pub async fn run(bridge: Bridge, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut calls = JoinSet::new();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => {
                // Fail whatever is still waiting instead of sitting out timeouts.
                bridge.close();
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            tracing::debug!("stdin closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let bridge = bridge.clone();
        let out_tx = out_tx.clone();
        let line = line.to_string();
        calls.spawn(async move {
            let _ = out_tx.send(handle_line(&bridge, &line).await);
        });
    }

    while calls.join_next().await.is_some() {}
    drop(out_tx);
    writer.await??;
    Ok(())
}
