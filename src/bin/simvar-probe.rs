//! Subscribe a handful of variables, poll them, and dump the engine state.
//!
//! Usage:
//!   cargo run --bin simvar-probe -- "L:A32NX_ELEC_BAT_1_POTENTIAL,Volts,200" \
//!       "COM ACTIVE FREQUENCY:1,MHz" --ticks 5
//!
//! With `--dry-run` the probe reads from an in-memory host seeded through
//! `--set NAME,UNIT=VALUE` instead of the simulated panel host.

use clap::Parser;
use log::{error, info, warn};
use simvar_sync::config::Config;
use simvar_sync::notifier::{Notification, NotifyFn};
use simvar_sync::{
    ExternalStateSource, MemorySource, RefreshPolicy, SimulatedPanelSource, SyncContext, Value,
    canonicalize,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

#[derive(Parser, Debug)]
#[command(name = "simvar-probe", version, about = "Poll simulator variables once and print the engine state")]
struct Args {
    /// Variables to subscribe, as NAME,UNIT[,INTERVAL_MS]
    #[arg(required = true, value_parser = parse_probe)]
    vars: Vec<ProbeVar>,

    /// Number of ticks to run before printing the snapshot
    #[arg(short, long, default_value_t = 3)]
    ticks: u32,

    /// JSON config file
    #[arg(short, long, env = "SIMVAR_CONFIG")]
    config: Option<PathBuf>,

    /// Read from an in-memory host instead of the simulated panels
    #[arg(long)]
    dry_run: bool,

    /// Seed the in-memory host, as NAME,UNIT=VALUE (dry run only)
    #[arg(long = "set", value_parser = parse_seed)]
    seeds: Vec<SeedVar>,
}

#[derive(Debug, Clone)]
struct ProbeVar {
    name: String,
    unit: String,
    interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
struct SeedVar {
    name: String,
    unit: String,
    value: Value,
}

fn parse_probe(raw: &str) -> Result<ProbeVar, String> {
    let mut parts = raw.splitn(3, ',').map(str::trim);
    let name = parts.next().filter(|s| !s.is_empty());
    let unit = parts.next().filter(|s| !s.is_empty());
    let (Some(name), Some(unit)) = (name, unit) else {
        return Err(format!("expected NAME,UNIT[,INTERVAL_MS], got '{raw}'"));
    };
    let interval_ms = parts
        .next()
        .map(|s| s.parse::<u64>().map_err(|e| format!("bad interval '{s}': {e}")))
        .transpose()?;
    Ok(ProbeVar {
        name: name.to_string(),
        unit: unit.to_string(),
        interval_ms,
    })
}

fn parse_seed(raw: &str) -> Result<SeedVar, String> {
    let (target, value) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected NAME,UNIT=VALUE, got '{raw}'"))?;
    let (name, unit) = target
        .split_once(',')
        .ok_or_else(|| format!("expected NAME,UNIT=VALUE, got '{raw}'"))?;
    let value = match value.trim() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        other => Value::Number(
            other
                .parse::<f64>()
                .map_err(|e| format!("bad value '{other}': {e}"))?,
        ),
    };
    Ok(SeedVar {
        name: name.trim().to_string(),
        unit: unit.trim().to_string(),
        value,
    })
}

fn build_source(args: &Args, config: &Config) -> Result<Arc<dyn ExternalStateSource>, String> {
    if !args.dry_run {
        return Ok(Arc::new(SimulatedPanelSource::new(config.simulation.clone())));
    }
    let memory = MemorySource::new();
    for seed in &args.seeds {
        let key = canonicalize(&seed.name, &seed.unit).map_err(|e| e.to_string())?;
        memory.set(&key, seed.value);
    }
    Ok(Arc::new(memory))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let config = match Config::resolve(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if !args.dry_run && !args.seeds.is_empty() {
        warn!("--set only applies with --dry-run, ignoring");
    }

    let source = match build_source(&args, &config) {
        Ok(source) => source,
        Err(e) => {
            error!("Invalid --set value: {}", e);
            std::process::exit(2);
        }
    };
    let ctx = SyncContext::new(source, config.poll.clone());
    let consumer = ctx.next_consumer_id();
    let callback: NotifyFn = Arc::new(|n: &Notification| {
        info!("[Probe] {} = {} (v{})", n.key, n.value, n.version);
    });

    let mut handles = Vec::new();
    for var in &args.vars {
        let interval = var
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.poll.default_interval());
        match ctx.subscribe(
            &var.name,
            &var.unit,
            interval,
            consumer,
            RefreshPolicy::OnChange,
            Arc::clone(&callback),
        ) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                error!("Cannot subscribe {},{}: {}", var.name, var.unit, e);
                std::process::exit(2);
            }
        }
    }

    for tick in 1..=args.ticks {
        if let Some(deadline) = ctx.next_deadline() {
            sleep_until(deadline).await;
        }
        let report = ctx.poll_due(Instant::now()).await;
        info!(
            "[Probe] Tick {}: {} read, {} updated, {} failed",
            tick, report.polled, report.updated, report.failed
        );
    }

    match serde_json::to_string_pretty(&ctx.snapshot()) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            error!("Failed to serialize snapshot: {}", e);
            std::process::exit(1);
        }
    }

    for handle in &handles {
        ctx.unsubscribe(handle);
    }
}
