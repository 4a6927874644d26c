//! celld: cellular data daemon
//!
//! Hosts the data connection control plane for one or more SIM slots.
//!
//! - Loads candidates and the initial roster from a TOML file
//! - Runs the connectivity policy loop over the default data slot
//! - In `--simulate` mode, drives one fake radio thread per slot so the
//!   whole attempt/retry/tear-down cycle can be watched locally
//!
//! ```bash
//! RUST_LOG=celld=debug,celld_core=info celld --simulate --slots 2 --seed 7
//! celld --config /etc/celld.toml
//! ```

mod policy;
mod radio;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use celld_common::models::{ActivationStatus, AppType, SubscriptionIdentity, SubscriptionRoster};
use celld_core::Purpose;
use celld_core::config::CelldConfig;
use celld_core::service::DataService;
use clap::Parser;
use crossbeam_channel::unbounded;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing_subscriber::EnvFilter;

/// Cellular data daemon.
#[derive(Parser, Debug)]
#[command(name = "celld", about = "Cellular data connection daemon")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drive a simulated radio instead of waiting for a real one.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Slot count when no configuration file is given.
    #[arg(long, default_value_t = 1)]
    slots: usize,

    /// Seed for the simulated radio.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Chance per second of a simulated SIM swap on the default slot.
    #[arg(long, default_value_t = 0.0)]
    swap_rate: f64,
}

/// Candidates used when simulating without a configuration file.
const DEMO_CANDIDATES: &str = r#"
    [[candidates]]
    id = "demo-internet"
    carrier = "00101"
    apn = "internet.demo"
    purposes = ["internet", "supl"]

    [[candidates]]
    id = "demo-internet-v6"
    carrier = "00101"
    apn = "ims.demo"
    purposes = ["internet", "ims"]
    protocol = "ipv6"

    [[candidates]]
    id = "demo-mms"
    carrier = "00101"
    apn = "mms.demo"
    purposes = ["mms"]

    [[candidates]]
    id = "demo-cdma"
    carrier = "00101"
    apn = "cdma.demo"
    purposes = "*"
    bearer = "ehrpd"
"#;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing::info!(
        slots = config.slots,
        candidates = config.candidates.len(),
        simulate = cli.simulate,
        seed = cli.seed,
        "celld starting"
    );

    let service = Arc::new(DataService::new(&config)?);
    if service.default_data_slot().is_none() {
        service.set_default_data_slot(Some(0))?;
    }

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("received SIGINT, shutting down");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    if !cli.simulate {
        tracing::info!("no radio attached; control plane idle");
        while running.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(200));
        }
        tracing::info!("celld stopped");
        return Ok(());
    }

    // ── Simulated radio, one thread per slot ────────────────────
    if config.roster.is_none() {
        service.on_roster_refresh(&demo_roster(config.slots)?)?;
    }
    let (report_tx, report_rx) = unbounded();
    let mut radios = Vec::with_capacity(config.slots);
    let mut handles = Vec::with_capacity(config.slots);
    for slot in 0..config.slots {
        let (cmd_tx, cmd_rx) = unbounded();
        handles.push(radio::spawn(
            slot,
            cli.seed,
            radio::RadioProfile::default(),
            cmd_rx,
            report_tx.clone(),
        )?);
        radios.push(cmd_tx);
    }
    drop(report_tx);

    // ── Policy loop ─────────────────────────────────────────────
    let mut policy = policy::Policy::new(
        service.clone(),
        report_rx,
        radios,
        vec![Purpose::Internet, Purpose::Mms],
        cli.swap_rate,
        StdRng::seed_from_u64(cli.seed ^ 0x5EED),
    );
    policy.start()?;
    while running.load(Ordering::Relaxed) {
        policy.step(Duration::from_millis(100));
    }

    // ── Cleanup ─────────────────────────────────────────────────
    policy.shutdown();
    drop(policy);
    for h in handles {
        if h.join().is_err() {
            tracing::error!("radio thread panicked");
        }
    }
    tracing::info!("celld stopped");
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<CelldConfig> {
    match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            CelldConfig::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))
        }
        None => {
            let candidates = if cli.simulate {
                CelldConfig::candidates_from_toml_str(DEMO_CANDIDATES)?
            } else {
                Vec::new()
            };
            anyhow::ensure!(cli.slots > 0, "--slots must be at least 1");
            Ok(CelldConfig {
                slots: cli.slots,
                candidates,
                ..CelldConfig::default()
            })
        }
    }
}

/// Slot 0 holds a USIM; any further slots hold CSIMs.
fn demo_roster(slots: usize) -> anyhow::Result<SubscriptionRoster> {
    let mut roster = SubscriptionRoster::new(slots);
    for slot in 0..slots {
        let app_type = if slot == 0 { AppType::Usim } else { AppType::Csim };
        let gsm = slot == 0;
        roster = roster.with_slot(
            slot,
            SubscriptionIdentity {
                slot: Some(slot),
                gsm_app_index: gsm.then_some(0),
                cdma_app_index: (!gsm).then_some(0),
                app_type,
                app_label: Some(format!("Demo {app_type}")),
                iccid: Some(format!("8900101000000000{slot:03}")),
                status: ActivationStatus::Activated,
                ..Default::default()
            },
        )?;
    }
    Ok(roster)
}
