//! Live scheduler configuration commands.

use super::ApiClient;
use anyhow::{Result, bail};
use serde_json::{Map, Value};

pub async fn set(
    client: &ApiClient,
    max_concurrent_jobs: Option<usize>,
    resource_threshold: Option<f64>,
) -> Result<()> {
    let mut update = Map::new();
    if let Some(max) = max_concurrent_jobs {
        update.insert("maxConcurrentJobs".to_string(), Value::from(max));
    }
    if let Some(threshold) = resource_threshold {
        update.insert("resourceThreshold".to_string(), Value::from(threshold));
    }
    if update.is_empty() {
        bail!("nothing to update: pass --max-concurrent-jobs and/or --resource-threshold");
    }

    let config = client.put("api/queue/config", &Value::Object(update)).await?;
    println!(
        "Max concurrent jobs: {}\nResource threshold:  {}%",
        config["maxConcurrentJobs"], config["resourceThreshold"]
    );
    Ok(())
}
