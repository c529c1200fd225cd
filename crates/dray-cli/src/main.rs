use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "dray", about = "Dray scheduler management CLI")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Scheduler URL
    #[arg(short, long, default_value = "http://localhost:8090", global = true)]
    url: String,

    /// API bearer token
    #[arg(long, env = "DRAY_API_TOKEN", global = true)]
    api_token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show capacity and queue status
    Status,
    /// Submit a job
    Submit {
        /// Addon the job belongs to
        #[arg(long)]
        addon: String,
        /// Job type label
        #[arg(long)]
        job_type: String,
        /// Priority: high, normal, low, background
        #[arg(long, default_value = "normal")]
        priority: String,
        /// Capacity units (1-100)
        #[arg(long, default_value = "10")]
        units: u32,
        /// Only grant to workers holding no other lease
        #[arg(long)]
        unique: bool,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Idempotency key
        #[arg(long)]
        idempotency_key: Option<String>,
        /// Abort the job after this many seconds of runtime
        #[arg(long)]
        max_runtime_s: Option<u64>,
    },
    /// List jobs
    Jobs {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show one job (live or from history)
    Job { job_id: String },
    /// Cancel a queued job
    Cancel { job_id: String },
    /// Show history statistics
    Stats {
        #[arg(long, default_value = "7")]
        days: u32,
    },
    /// Show recent audit events
    Events {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Prune job history older than N days
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Show the current health snapshot
    Health,
    /// Read or write app settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    /// List all settings
    List,
    /// Show one setting
    Get { key: String },
    /// Set a setting (value is JSON; bare strings are quoted for you)
    Set { key: String, value: String },
    /// Delete a setting
    Delete { key: String },
}

struct Api {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl Api {
    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let resp = self
            .with_auth(self.http.get(format!("{}{}", self.base, path)))
            .send()
            .await?;
        Ok(resp.json().await?)
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let resp = self
            .with_auth(self.http.post(format!("{}{}", self.base, path)).json(&body))
            .send()
            .await?;
        Ok(resp.json().await?)
    }

    async fn put(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let resp = self
            .with_auth(self.http.put(format!("{}{}", self.base, path)).json(&body))
            .send()
            .await?;
        Ok(resp.json().await?)
    }

    async fn delete(&self, path: &str) -> anyhow::Result<Value> {
        let resp = self
            .with_auth(self.http.delete(format!("{}{}", self.base, path)))
            .send()
            .await?;
        Ok(resp.json().await?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let api = Api {
        http: reqwest::Client::new(),
        base: args.url.trim_end_matches('/').to_string(),
        token: args.api_token.clone(),
    };

    match args.command {
        Commands::Status => {
            let resp = api.get("/scheduler/status").await?;
            println!("Dray Scheduler Status");
            println!("══════════════════════════════");
            println!("  Version:       {}", resp["version"].as_str().unwrap_or("?"));
            println!("  Uptime:        {}s", resp["uptime_seconds"]);
            println!("  Busy rating:   {:.1}/10", resp["busy_rating"].as_f64().unwrap_or(10.0));
            println!(
                "  Capacity:      {} leased / {} usable / {} total",
                resp["leased_capacity_units"], resp["usable_capacity_units"], resp["total_capacity_units"]
            );
            println!("  Available:     {}", resp["available_capacity_units"]);
            println!("  Queued jobs:   {}", resp["queued_jobs"]);
            if let Some(depths) = resp["queue_depths"].as_object() {
                for (class, depth) in depths {
                    println!("    {:<12} {}", class, depth);
                }
            }
            if let Some(leases) = resp["active_leases"].as_array() {
                println!("  Active leases: {}", leases.len());
                for lease in leases {
                    println!(
                        "    {} — worker {} ({} units, expires {})",
                        lease["lease_id"].as_str().unwrap_or("?"),
                        lease["worker_id"].as_str().unwrap_or("?"),
                        lease["capacity_units"],
                        lease["expires_at"].as_str().unwrap_or("?")
                    );
                }
            }
        }
        Commands::Submit {
            addon,
            job_type,
            priority,
            units,
            unique,
            payload,
            idempotency_key,
            max_runtime_s,
        } => {
            let payload: Value = match payload {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("payload is not valid JSON: {e}"))?,
                None => Value::Null,
            };
            let mut body = json!({
                "addon_id": addon,
                "job_type": job_type,
                "priority": priority,
                "requested_units": units,
                "unique": unique,
                "payload": payload,
            });
            if let Some(key) = idempotency_key {
                body["idempotency_key"] = json!(key);
            }
            if let Some(max) = max_runtime_s {
                body["max_runtime_s"] = json!(max);
            }
            let resp = api.post("/scheduler/jobs", body).await?;
            match resp["job_id"].as_str() {
                Some(job_id) => {
                    let dedup = resp["deduplicated"].as_bool().unwrap_or(false);
                    println!(
                        "{} {} (state: {})",
                        if dedup { "Existing job" } else { "Submitted" },
                        job_id,
                        resp["state"].as_str().unwrap_or("?")
                    );
                }
                None => println!(
                    "Error: {} ({})",
                    resp["detail"].as_str().unwrap_or("unknown"),
                    resp["code"].as_str().unwrap_or("?")
                ),
            }
        }
        Commands::Jobs { state, limit } => {
            let mut path = format!("/scheduler/jobs?limit={limit}");
            if let Some(state) = state {
                path.push_str(&format!("&state={state}"));
            }
            let resp = api.get(&path).await?;
            println!("Jobs ({})", resp["count"]);
            println!("══════════════════════════════");
            if let Some(jobs) = resp["jobs"].as_array() {
                for job in jobs {
                    println!(
                        "  {} [{}] {}/{} {}u — {}",
                        job["job_id"].as_str().unwrap_or("?"),
                        job["state"].as_str().unwrap_or("?"),
                        job["addon_id"].as_str().unwrap_or("?"),
                        job["job_type"].as_str().unwrap_or("?"),
                        job["requested_units"],
                        job["created_at"].as_str().unwrap_or("?")
                    );
                }
            }
        }
        Commands::Job { job_id } => {
            let resp = api.get(&format!("/scheduler/jobs/{job_id}")).await?;
            if resp["job"].is_object() {
                println!("{}", serde_json::to_string_pretty(&resp)?);
            } else {
                println!("Error: {}", resp["detail"].as_str().unwrap_or("unknown"));
            }
        }
        Commands::Cancel { job_id } => {
            let resp = api.delete(&format!("/scheduler/jobs/{job_id}")).await?;
            if resp["ok"].as_bool().unwrap_or(false) {
                println!("Cancelled {job_id}");
            } else {
                println!(
                    "Error: {} ({})",
                    resp["detail"].as_str().unwrap_or("unknown"),
                    resp["code"].as_str().unwrap_or("?")
                );
            }
        }
        Commands::Stats { days } => {
            let resp = api.get(&format!("/scheduler/history/stats?days={days}")).await?;
            println!("History ({} days)", resp["days"]);
            println!("══════════════════════════════");
            println!("  Total jobs:    {}", resp["total_jobs"]);
            println!(
                "  Success rate:  {:.1}%",
                resp["success_rate"].as_f64().unwrap_or(0.0) * 100.0
            );
            println!(
                "  Avg wait:      {:.2}s",
                resp["avg_queue_wait_s"].as_f64().unwrap_or(0.0)
            );
            if let Some(states) = resp["by_state"].as_object() {
                for (state, count) in states {
                    println!("    {:<12} {}", state, count);
                }
            }
            if let Some(addons) = resp["addons"].as_array() {
                println!("  Addons:");
                for addon in addons {
                    println!(
                        "    {} — {} jobs, avg {:.2}s, p95 {:.2}s",
                        addon["addon_id"].as_str().unwrap_or("?"),
                        addon["jobs"],
                        addon["avg_runtime_s"].as_f64().unwrap_or(0.0),
                        addon["p95_runtime_s"].as_f64().unwrap_or(0.0)
                    );
                }
            }
        }
        Commands::Events { limit } => {
            let resp = api.get(&format!("/scheduler/history/events?limit={limit}")).await?;
            println!("Events ({})", resp["count"]);
            println!("══════════════════════════════");
            if let Some(events) = resp["events"].as_array() {
                for event in events {
                    println!(
                        "  {} {:<14} {} {}",
                        event["ts"].as_str().unwrap_or("?"),
                        event["type"].as_str().unwrap_or("?"),
                        event["entity_kind"].as_str().unwrap_or("?"),
                        event["entity_id"].as_str().unwrap_or("?")
                    );
                }
            }
        }
        Commands::Cleanup { days } => {
            let path = match days {
                Some(d) => format!("/scheduler/history/cleanup?days={d}"),
                None => "/scheduler/history/cleanup".to_string(),
            };
            let resp = api.post(&path, json!({})).await?;
            println!(
                "Deleted {} history rows, {} events",
                resp["deleted_jobs"], resp["deleted_events"]
            );
        }
        Commands::Health => {
            let resp = api.get("/system/stats/current").await?;
            if resp["busy_rating"].is_null() {
                println!("No health sample yet ({})", resp["detail"].as_str().unwrap_or("?"));
            } else {
                println!("System Health");
                println!("══════════════════════════════");
                println!(
                    "  Busy rating:  {:.1}/10",
                    resp["busy_rating"].as_f64().unwrap_or(10.0)
                );
                println!(
                    "  CPU:          {:.1}%",
                    resp["host"]["cpu_percent"].as_f64().unwrap_or(0.0)
                );
                println!(
                    "  Memory:       {} / {} MB",
                    resp["host"]["memory_used_mb"], resp["host"]["memory_total_mb"]
                );
                println!("  Load (1m):    {}", resp["host"]["load_1"]);
                println!("  API rps:      {}", resp["api"]["rps"]);
                println!("  API p95:      {} ms", resp["api"]["latency_ms_p95"]);
                println!("  API inflight: {}", resp["api"]["inflight"]);
                if let Some(signals) = resp["signals"].as_object() {
                    println!("  Signals:");
                    for (name, score) in signals {
                        println!("    {:<16} {:.1}", name, score.as_f64().unwrap_or(0.0));
                    }
                }
            }
        }
        Commands::Settings { action } => match action {
            SettingsAction::List => {
                let resp = api.get("/system/settings").await?;
                println!("{}", serde_json::to_string_pretty(&resp["settings"])?);
            }
            SettingsAction::Get { key } => {
                let resp = api.get(&format!("/system/settings/{key}")).await?;
                if resp["value"].is_null() && resp["detail"].is_string() {
                    println!("Error: {}", resp["detail"].as_str().unwrap_or("unknown"));
                } else {
                    println!("{}", serde_json::to_string_pretty(&resp["value"])?);
                }
            }
            SettingsAction::Set { key, value } => {
                // Accept raw JSON; fall back to treating the input as a string.
                let value: Value =
                    serde_json::from_str(&value).unwrap_or_else(|_| Value::String(value));
                let resp = api.put(&format!("/system/settings/{key}"), value).await?;
                if resp["ok"].as_bool().unwrap_or(false) {
                    println!("Set {key}");
                } else {
                    println!("Error: {}", resp["detail"].as_str().unwrap_or("unknown"));
                }
            }
            SettingsAction::Delete { key } => {
                let resp = api.delete(&format!("/system/settings/{key}")).await?;
                if resp["ok"].as_bool().unwrap_or(false) {
                    println!("Deleted {key}");
                } else {
                    println!("Error: {}", resp["detail"].as_str().unwrap_or("unknown"));
                }
            }
        },
    }

    Ok(())
}
