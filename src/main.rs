use clap::Parser;
use log::{error, info, warn};
use simvar_sync::config::Config;
use simvar_sync::hook::RenderFn;
use simvar_sync::source::simulation::vars;
use simvar_sync::{HookScope, PollDriver, RefreshPolicy, SimulatedPanelSource, SyncContext};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};

/// Run the battery and radio panels against the simulated host.
#[derive(Parser, Debug)]
#[command(name = "simvar-sync", version, about)]
struct Args {
    /// JSON config file (defaults to the user config dir if present)
    #[arg(short, long, env = "SIMVAR_CONFIG")]
    config: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(short, long, env = "SIMVAR_DEMO_DURATION")]
    duration_secs: Option<u64>,

    /// Press the radio transfer button every N seconds (0 disables)
    #[arg(long, default_value_t = 5)]
    transfer_every_secs: u64,

    /// Override the simulated read failure rate
    #[arg(long)]
    failure_rate: Option<f64>,

    /// Fixed RNG seed for the simulated host
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Panel {
    Battery,
    Radio,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn render_request(tx: &mpsc::UnboundedSender<Panel>, panel: Panel) -> RenderFn {
    let tx = tx.clone();
    Arc::new(move || {
        // Receiver gone means we are shutting down.
        let _ = tx.send(panel);
    })
}

fn fmt_reading(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(v) => format!("{v:.decimals$}"),
        None => "--".to_string(),
    }
}

fn render_battery_panel(scope: &HookScope) -> simvar_sync::Result<()> {
    let bat_1 = scope.bind(vars::BAT_1_POTENTIAL, "Volts", 200)?;
    let bat_2 = scope.bind(vars::BAT_2_POTENTIAL, "Volts", 200)?;
    let amp_1 = scope.bind(vars::BAT_1_CURRENT, "Amperes", 500)?;
    let amp_2 = scope.bind(vars::BAT_2_CURRENT, "Amperes", 500)?;
    let normal_1 = scope.bind(vars::BAT_1_POTENTIAL_NORMAL, "Bool", 500)?;
    let normal_2 = scope.bind(vars::BAT_2_POTENTIAL_NORMAL, "Bool", 500)?;

    let flag = |normal: Option<bool>| match normal {
        Some(false) => " (LO)",
        _ => "",
    };
    info!(
        "[Demo] BAT 1 {} V {} A{} | BAT 2 {} V {} A{}",
        fmt_reading(bat_1.get_f64(), 1),
        fmt_reading(amp_1.get_f64(), 0),
        flag(normal_1.get_bool()),
        fmt_reading(bat_2.get_f64(), 1),
        fmt_reading(amp_2.get_f64(), 0),
        flag(normal_2.get_bool()),
    );
    Ok(())
}

fn render_radio_panel(scope: &HookScope) -> simvar_sync::Result<()> {
    let active = scope.bind_with(vars::COM_ACTIVE, "MHz", 200, RefreshPolicy::every_poll())?;
    let standby = scope.bind(vars::COM_STANDBY, "MHz", 200)?;
    let transmit = scope.bind(vars::COM_TRANSMIT, "Bool", 500)?;

    info!(
        "[Demo] COM1 {} <> {}{}",
        fmt_reading(active.get_f64(), 3),
        fmt_reading(standby.get_f64(), 3),
        if transmit.get_bool() == Some(true) {
            " TX"
        } else {
            ""
        }
    );
    Ok(())
}

fn render(panel: Panel, battery: &HookScope, radio: &HookScope) {
    let result = match panel {
        Panel::Battery => render_battery_panel(battery),
        Panel::Radio => render_radio_panel(radio),
    };
    if let Err(e) = result {
        error!("[Demo] Failed to render {:?} panel: {}", panel, e);
    }
}

#[tokio::main]
async fn main() {
    init_logger();
    let args = Args::parse();
    info!("Starting simvar-sync panel demo");

    let mut config = match Config::resolve(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(rate) = args.failure_rate {
        config.simulation.failure_rate = rate;
    }
    if args.seed.is_some() {
        config.simulation.seed = args.seed;
    }
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("Configuration loaded:");
    info!("  Default interval: {}ms", config.poll.default_interval_ms);
    info!("  Minimum interval: {}ms", config.poll.min_interval_ms);
    info!("  Read timeout: {}ms", config.poll.read_timeout_ms);
    info!("  Simulated failure rate: {}", config.simulation.failure_rate);

    let source = Arc::new(SimulatedPanelSource::new(config.simulation.clone()));
    let ctx = SyncContext::new(source, config.poll.clone());
    let driver = PollDriver::spawn(ctx.clone());

    let (render_tx, mut render_rx) = mpsc::unbounded_channel::<Panel>();
    let battery = HookScope::new(
        ctx.clone(),
        "battery-panel",
        render_request(&render_tx, Panel::Battery),
    );
    let radio = HookScope::new(
        ctx.clone(),
        "radio-panel",
        render_request(&render_tx, Panel::Radio),
    );

    // Mount: the first render pass performs the bindings.
    render(Panel::Battery, &battery, &radio);
    render(Panel::Radio, &battery, &radio);

    let transfer_task = (args.transfer_every_secs > 0).then(|| {
        let ctx = ctx.clone();
        let period = Duration::from_secs(args.transfer_every_secs);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!("[Demo] Pressing COM1 transfer");
                if let Err(e) = ctx.write(vars::RMP_TRANSFER, "Bool", true).await {
                    warn!("[Demo] Transfer failed: {}", e);
                }
            }
        })
    });

    let stop_after = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(stop_after);

    info!("Panels mounted, press Ctrl+C to exit");
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received shutdown signal"),
                    Err(e) => error!("Failed to listen for shutdown signal: {}", e),
                }
                break;
            }
            _ = &mut stop_after => {
                info!("Demo duration elapsed");
                break;
            }
            Some(first) = render_rx.recv() => {
                // Coalesce requests queued during the same tick.
                let mut pending = HashSet::from([first]);
                while let Ok(panel) = render_rx.try_recv() {
                    pending.insert(panel);
                }
                for panel in pending {
                    render(panel, &battery, &radio);
                }
            }
        }
    }

    // Shutdown
    if let Some(task) = transfer_task {
        task.abort();
    }
    battery.teardown();
    radio.teardown();

    match serde_json::to_string_pretty(&ctx.snapshot()) {
        Ok(json) => info!("Final engine state:\n{}", json),
        Err(e) => warn!("Failed to serialize engine state: {}", e),
    }

    driver.shutdown().await;
    info!("simvar-sync stopped");
}
