use anyhow::{Context, Result};
use prometheus::{Encoder, Gauge, Registry, TextEncoder};
use tracing::warn;

use crate::config::Config;

/// Every cron command pushes how long it ran and whether it succeeded, even
/// when it failed partway. Lock contention does not count as a run.
pub async fn push_run_metrics(config: &Config, command: &str, took_msecs: i64, success: bool) {
    let Some(url) = &config.prometheus_push_url else {
        return;
    };
    if let Err(e) = push(config, url, command, took_msecs, success).await {
        warn!("push of prometheus metrics to '{}' failed: {}", url, e);
    }
}

async fn push(
    config: &Config,
    url: &str,
    command: &str,
    took_msecs: i64,
    success: bool,
) -> Result<()> {
    let prefix = format!("brokkr_cron_{}", command.replace('-', "_"));

    let registry = Registry::new();
    let took = Gauge::new(
        format!("{}_run_time", prefix),
        "How long did the job take (in milliseconds)",
    )?;
    took.set(took_msecs as f64);
    let succeeded = Gauge::new(
        format!("{}_success", prefix),
        "Whether the job completed with success(1) or failure(0)",
    )?;
    succeeded.set(if success { 1.0 } else { 0.0 });
    registry.register(Box::new(took))?;
    registry.register(Box::new(succeeded))?;

    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buf)
        .context("encoding metrics")?;

    let endpoint = format!("{}/metrics/job/{}", url.trim_end_matches('/'), prefix);
    let client = reqwest::Client::new();
    let mut req = client.put(&endpoint).body(buf);
    if let Some(user) = &config.prometheus_push_user {
        req = req.basic_auth(user, config.prometheus_push_pass.as_deref());
    }
    let resp = req.send().await.context("pushing metrics")?;
    if !resp.status().is_success() {
        anyhow::bail!("push gateway returned {}", resp.status());
    }
    Ok(())
}
