/// Reference pull worker.
///
/// Polls the scheduler for leases, honors denial retry hints, heartbeats
/// while holding a lease, and reports completion. Work is simulated: the
/// job payload may carry `duration_ms` (default 1000) and `fail: true`.
///
/// The loop demonstrates the full pull protocol:
///   lease request → (denied: back off) | (granted: heartbeat + work) →
///   complete → repeat.

use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dray-worker", about = "Dray pull worker")]
struct Args {
    /// Scheduler base URL
    #[arg(short, long, default_value = "http://localhost:8090")]
    url: String,

    /// Worker identity; generated when omitted
    #[arg(short, long)]
    worker_id: Option<String>,

    /// Largest lease this worker will accept, in capacity units
    #[arg(long)]
    max_units: Option<u32>,

    /// Heartbeat cadence while holding a lease
    #[arg(long, default_value = "10")]
    heartbeat_interval_s: u64,

    /// Minimum wait between polls, regardless of the server's retry hint
    #[arg(long, default_value = "500")]
    poll_floor_ms: u64,

    /// Process a single job, then exit
    #[arg(long)]
    once: bool,

    /// API bearer token
    #[arg(long, env = "DRAY_API_TOKEN")]
    api_token: Option<String>,
}

struct Api {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl Api {
    async fn post(&self, path: &str, body: Value) -> anyhow::Result<(u16, Value)> {
        let mut req = self.http.post(format!("{}{}", self.base, path)).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, body))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let worker_id = args.worker_id.clone().unwrap_or_else(|| {
        format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8])
    });

    let api = Api {
        http: reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default(),
        base: args.url.trim_end_matches('/').to_string(),
        token: args.api_token.clone(),
    };

    info!(worker = %worker_id, url = %api.base, "worker starting");

    loop {
        let pulled = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            r = pull_one(&api, &worker_id, &args) => r,
        };

        match pulled {
            Ok(true) if args.once => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "scheduler unreachable, retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }

    info!(worker = %worker_id, "worker stopped");
    Ok(())
}

/// One poll cycle. Returns true when a job was executed.
async fn pull_one(api: &Api, worker_id: &str, args: &Args) -> anyhow::Result<bool> {
    let mut body = json!({ "worker_id": worker_id });
    if let Some(max) = args.max_units {
        body["max_units"] = json!(max);
    }
    let (status, resp) = api.post("/scheduler/leases/request", body).await?;
    if status != 200 {
        anyhow::bail!("lease request failed: HTTP {status} {resp}");
    }

    if resp["denied"].as_bool().unwrap_or(false) {
        let retry_ms = resp["retry_after_ms"].as_u64().unwrap_or(1000);
        let wait = retry_ms.max(args.poll_floor_ms);
        debug!(
            reason = resp["reason"].as_str().unwrap_or("?"),
            retry_ms, "no work, backing off"
        );
        tokio::time::sleep(Duration::from_millis(wait)).await;
        return Ok(false);
    }

    let lease_id = resp["lease"]["lease_id"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let job = resp["job"].clone();
    info!(
        lease = %lease_id,
        job = job["job_id"].as_str().unwrap_or("?"),
        job_type = job["job_type"].as_str().unwrap_or("?"),
        units = job["requested_units"].as_u64().unwrap_or(0),
        "lease granted"
    );

    execute(api, worker_id, &lease_id, &job, args).await?;
    Ok(true)
}

/// Run (simulate) the job while heartbeating, then report completion.
async fn execute(
    api: &Api,
    worker_id: &str,
    lease_id: &str,
    job: &Value,
    args: &Args,
) -> anyhow::Result<()> {
    let duration_ms = job["payload"]["duration_ms"].as_u64().unwrap_or(1000);
    let should_fail = job["payload"]["fail"].as_bool().unwrap_or(false);

    let work = tokio::time::sleep(Duration::from_millis(duration_ms));
    tokio::pin!(work);
    // First tick fires immediately, promoting the job to running.
    let mut heartbeat = tokio::time::interval(Duration::from_secs(args.heartbeat_interval_s));

    loop {
        tokio::select! {
            _ = &mut work => break,
            _ = heartbeat.tick() => {
                let (status, resp) = api
                    .post(
                        &format!("/scheduler/leases/{lease_id}/heartbeat"),
                        json!({ "worker_id": worker_id }),
                    )
                    .await?;
                if status == 200 {
                    debug!(lease = %lease_id, "heartbeat ok");
                } else {
                    // Lease expired or taken away; stop working on it.
                    warn!(lease = %lease_id, status, detail = resp["detail"].as_str().unwrap_or(""), "lease lost");
                    return Ok(());
                }
            }
        }
    }

    let (status_str, result, error) = if should_fail {
        ("failed", Value::Null, json!("simulated failure"))
    } else {
        (
            "completed",
            json!({ "duration_ms": duration_ms }),
            Value::Null,
        )
    };

    let (status, resp) = api
        .post(
            &format!("/scheduler/leases/{lease_id}/complete"),
            json!({
                "worker_id": worker_id,
                "status": status_str,
                "result": result,
                "error": error,
            }),
        )
        .await?;
    if status == 200 {
        info!(lease = %lease_id, status = status_str, "job finished");
    } else {
        warn!(lease = %lease_id, status, detail = resp["detail"].as_str().unwrap_or(""), "complete rejected");
    }
    Ok(())
}
