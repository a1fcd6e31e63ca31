//! Queue commands.

use super::ApiClient;
use anyhow::Result;
use conveyor_core::queue::Priority;
use serde_json::{Value, json};

pub async fn status(client: &ApiClient) -> Result<()> {
    let body = client.get("api/queue/status").await?;
    let processing = body["processing"].as_bool().unwrap_or(false);
    println!(
        "Processing: {}  (max {} concurrent, threshold {}%)",
        if processing { "running" } else { "paused" },
        body["config"]["maxConcurrentJobs"],
        body["config"]["resourceThreshold"]
    );

    let running = entries(&body, "running");
    println!("\nRunning ({}):", running.len());
    for entry in running {
        println!(
            "  {}  {:<24} {:>3}%",
            text(entry, "id"),
            text(entry, "jobId"),
            entry["progress"].as_u64().unwrap_or(0)
        );
    }

    let pending = entries(&body, "pending");
    println!("\nQueued ({}):", pending.len());
    for entry in pending {
        println!(
            "  {}  {:<24} {:<6} retry {}",
            text(entry, "id"),
            text(entry, "jobId"),
            text(entry, "priority"),
            entry["retryCount"].as_u64().unwrap_or(0)
        );
    }
    Ok(())
}

pub async fn stats(client: &ApiClient) -> Result<()> {
    let body = client.get("api/queue/stats").await?;
    for key in [
        "queued",
        "running",
        "completed",
        "failed",
        "cancelled",
        "retried",
        "dispatched",
        "processing",
        "currentUsage",
    ] {
        println!("{:<12} {}", key, body[key]);
    }
    Ok(())
}

pub async fn add(
    client: &ApiClient,
    job_id: &str,
    priority: Priority,
    max_retries: Option<u32>,
    estimated_time: Option<u64>,
) -> Result<()> {
    let mut request = json!({ "jobId": job_id, "priority": priority });
    if let Some(max_retries) = max_retries {
        request["maxRetries"] = json!(max_retries);
    }
    if let Some(estimated_time) = estimated_time {
        request["estimatedTime"] = json!(estimated_time);
    }

    let body = client.post("api/queue", &request).await?;
    println!("Queued {} as {}", job_id, text(&body, "queueJobId"));
    Ok(())
}

pub async fn cancel(client: &ApiClient, id: &str) -> Result<()> {
    client.delete(&format!("api/queue/{}", id)).await?;
    println!("Cancelled {}", id);
    Ok(())
}

pub async fn show(client: &ApiClient, id: &str) -> Result<()> {
    let body = client.get(&format!("api/queue/{}", id)).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn entries<'a>(body: &'a Value, key: &str) -> &'a [Value] {
    body[key].as_array().map(Vec::as_slice).unwrap_or_default()
}

fn text<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("-")
}
