// src/analyze/script.rs
//! Shell scripts as filters: JSON on stdin, JSON on stdout, bounded by a timeout.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::ingest::types::Item;

/// Run `script` with `sh -c`, feeding `input` on stdin. The child is killed
/// when the timeout expires. Returns raw stdout on a zero exit status.
pub async fn run_script(script: &str, input: Vec<u8>, limit: Duration) -> Result<Vec<u8>> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("spawning script")?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("script stdin not captured"))?;
    let feeder = tokio::spawn(async move {
        // A script that ignores stdin closes the pipe early; that is fine.
        let _ = stdin.write_all(&input).await;
        let _ = stdin.shutdown().await;
    });

    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(res) => res.context("waiting for script")?,
        Err(_) => {
            feeder.abort();
            bail!("script timed out after {}s", limit.as_secs());
        }
    };
    let _ = feeder.await;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "script exited with {}: {}",
            output.status,
            stderr.trim().chars().take(500).collect::<String>()
        );
    }
    Ok(output.stdout)
}

/// Parse script output as a JSON array, falling back to JSON lines.
fn parse_output_objects(out: &str) -> Result<Vec<Value>> {
    if let Ok(arr) = serde_json::from_str::<Vec<Value>>(out) {
        return Ok(arr);
    }
    let mut objects = Vec::new();
    for line in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let v: Value = serde_json::from_str(line).with_context(|| {
            let preview: String = out.chars().take(200).collect();
            format!("script output is neither a JSON array nor JSON lines: {preview}")
        })?;
        objects.push(v);
    }
    Ok(objects)
}

/// Filter items through a script. Survivors are matched back to the input by
/// link, so input order and all fields are preserved. Empty output means
/// every item was filtered out.
pub async fn filter_items(items: Vec<Item>, script: &str, limit: Duration) -> Result<Vec<Item>> {
    if items.is_empty() {
        return Ok(items);
    }
    let input = serde_json::to_vec(&items).context("serializing items for script")?;
    let stdout = run_script(script, input, limit).await?;
    let text = String::from_utf8_lossy(&stdout);
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let survivors: HashSet<String> = parse_output_objects(text)?
        .iter()
        .filter_map(|v| v.get("link").and_then(Value::as_str).map(str::to_string))
        .collect();
    Ok(items
        .into_iter()
        .filter(|it| survivors.contains(&it.link))
        .collect())
}
