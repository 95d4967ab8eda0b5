//! `deepeyes status`: ask a running server for its health.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::terminal_output::{note_success, note_warn};

pub async fn run(bind: &str, port: u16) -> Result<()> {
    // A wildcard bind is reachable on loopback.
    let host = match bind {
        "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
        other => other,
    };
    let url = format!("http://{host}:{port}/api/health");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("Failed to build HTTP client")?;

    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let body: serde_json::Value = resp.json().await?;
            note_success(&format!("DeepEyes is running at {host}:{port}"));
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Ok(resp) => note_warn(&format!("Health check at {url} returned {}", resp.status())),
        Err(_) => note_warn(&format!("DeepEyes is not running on {host}:{port}")),
    }
    Ok(())
}
