use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::geo::GeoDb;
use crate::pipeline;
use crate::schema::Schema;
use crate::tunnel::TunnelHandle;

/// Key whose presence pauses job consumption.
const STOP_KEY: &str = "Log:Stop";

/// Hash mapping schema slots to schema sources.
const CONFIG_KEY: &str = "Log:Config";

/// Idle/backoff delay between polls.
const POLL_DELAY: Duration = Duration::from_secs(2);

/// Polls the cache for `[path, slot]` jobs and runs one file cycle per
/// job with the schema stored under the job's slot. Runs until cancelled.
pub async fn run(
    redis_addr: &str,
    queue_name: &str,
    geo: &mut GeoDb,
    tunnel: &TunnelHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let url = if redis_addr.contains("://") {
        redis_addr.to_string()
    } else {
        format!("redis://{redis_addr}")
    };
    let client = redis::Client::open(url.as_str())
        .with_context(|| format!("invalid redis address {redis_addr}"))?;
    let mut con = client
        .get_multiplexed_async_connection()
        .await
        .with_context(|| format!("connecting to redis at {redis_addr}"))?;

    info!(addr = redis_addr, queue = queue_name, "queue mode started");

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let job = match next_job(&mut con, queue_name).await {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "cache rpc error");
                pause(&cancel).await;
                continue;
            }
        };

        let Some((path, schema_src)) = job else {
            pause(&cancel).await;
            continue;
        };

        let mut schema = match Schema::parse(&schema_src) {
            Ok(schema) => schema,
            Err(e) => {
                error!(error = %e, "invalid schema got from queue");
                continue;
            }
        };
        schema.normalize();

        // A bad input file fails only this job, not the queue loop.
        if let Err(e) = pipeline::run_cycle(Path::new(&path), &schema, geo, tunnel).await {
            warn!(error = %e, path, "cycle failed");
        }
    }
}

/// One poll step: honor the stop flag, pop a job, fetch its schema.
/// `None` means nothing to do right now (caller sleeps).
async fn next_job(
    con: &mut redis::aio::MultiplexedConnection,
    queue_name: &str,
) -> Result<Option<(String, String)>> {
    let stop: Option<String> = con.get(STOP_KEY).await.context("GET stop flag")?;
    if stop.is_some() {
        return Ok(None);
    }

    let job: Option<String> = con
        .lpop(queue_name, None)
        .await
        .with_context(|| format!("LPOP {queue_name}"))?;
    let Some(job) = job else {
        return Ok(None);
    };

    let Some((path, slot)) = parse_job(&job) else {
        warn!(job, "malformed job payload");
        return Ok(None);
    };
    info!(path, slot, "job received");

    let schema_src: Option<String> = con
        .hget(CONFIG_KEY, &slot)
        .await
        .with_context(|| format!("HGET {CONFIG_KEY} {slot}"))?;
    let Some(schema_src) = schema_src else {
        warn!(slot, "no schema configured for slot");
        return Ok(None);
    };

    Ok(Some((path, schema_src)))
}

/// Jobs are two-element JSON arrays `[path, slot]`; the slot may arrive
/// as a string or a number.
fn parse_job(raw: &str) -> Option<(String, String)> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let items = value.as_array()?;
    if items.len() != 2 {
        return None;
    }

    let path = items[0].as_str()?.to_string();
    let slot = match &items[1] {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some((path, slot))
}

async fn pause(cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(POLL_DELAY) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_string_slot() {
        let job = parse_job("[\"/data/access.log\", \"nginx\"]").expect("job");
        assert_eq!(job.0, "/data/access.log");
        assert_eq!(job.1, "nginx");
    }

    #[test]
    fn test_parse_job_numeric_slot() {
        let job = parse_job("[\"/data/a.gz\", 3]").expect("job");
        assert_eq!(job.1, "3");
    }

    #[test]
    fn test_parse_job_rejects_malformed() {
        assert!(parse_job("not json").is_none());
        assert!(parse_job("{\"path\": \"x\"}").is_none());
        assert!(parse_job("[\"only-one\"]").is_none());
        assert!(parse_job("[1, 2]").is_none());
    }
}
