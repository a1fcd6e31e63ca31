//! CLI command implementations.

pub mod config;
pub mod queue;

use anyhow::{Context, Result, bail};
use reqwest::{Method, RequestBuilder};
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

/// Thin JSON client for the queue management API.
pub struct ApiClient {
    base: Url,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let mut base = Url::parse(api_url).with_context(|| format!("invalid API URL: {}", api_url))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            http: reqwest::Client::new(),
        })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(self.request(Method::GET, path)?).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(self.request(Method::POST, path)?.json(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(self.request(Method::PUT, path)?.json(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.send(self.request(Method::DELETE, path)?).await
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.endpoint(path)?;
        debug!(method = %method, url = %url, "API request");
        Ok(self.http.request(method, url))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value> {
        let response = request.send().await.context("failed to reach API server")?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("request failed");
            bail!("{} ({})", message, status);
        }
        Ok(body)
    }
}

pub async fn toggle(client: &ApiClient, action: &str) -> Result<()> {
    let body = client
        .post("api/queue/toggle", &json!({ "action": action }))
        .await?;
    let processing = body
        .get("processing")
        .and_then(|p| p.as_bool())
        .unwrap_or(false);
    println!(
        "Queue processing {}",
        if processing { "running" } else { "paused" }
    );
    Ok(())
}

pub fn validate(path: &str) -> Result<()> {
    match conveyor_config::SystemConfig::load(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  listen:              {}", config.server.listen);
            println!(
                "  max concurrent jobs: {}",
                config.scheduler.max_concurrent_jobs
            );
            println!(
                "  resource threshold:  {}%",
                config.scheduler.resource_threshold
            );
            println!("  jobs:                {}", config.jobs.len());
            for job in &config.jobs {
                println!(
                    "    {} ({} {} via {})",
                    job.id, job.repository, job.branch, job.trigger_mode
                );
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
