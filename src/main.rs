// NetBox IPMI Move Auditor Daemon

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use ipmi_auditor::{
    collector::FdbCollector,
    config::{self, Config},
    correlator::Correlator,
    logging,
    netbox::NetBoxClient,
    notifier::Notifier,
    state::StateStore,
    types::{AlertInfo, MoveEvent, MoveStatus},
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};

// Configuration constants for the poll loop

/// Days of alert history kept across restarts
const ALERT_RETENTION_DAYS: i64 = 30;

/// Seconds to back off after an unexpected cycle failure
const ERROR_BACKOFF_SECS: u64 = 60;

/// Granularity of the inter-cycle sleep; the shutdown flag is observed at
/// this interval so signals cut the wait short
const SLEEP_STEP: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "ipmi-auditor")]
#[command(about = "NetBox IPMI move auditor daemon", long_about = None)]
struct Args {
    /// Optional KEY=VALUE file loaded into the environment before
    /// configuration is read (variables already set win)
    #[arg(long)]
    env_file: Option<PathBuf>,
}

/// The auditor: owns all components and drives the poll loop.
struct Auditor {
    config: Config,
    netbox: NetBoxClient,
    collector: FdbCollector,
    correlator: Correlator,
    state: StateStore,
    notifier: Notifier,
    shutdown: Arc<AtomicBool>,
}

impl Auditor {
    fn new(config: Config, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let netbox = NetBoxClient::new(&config).context("Failed to create inventory client")?;
        let collector = FdbCollector::new(&config);
        let correlator = Correlator::new(&config);
        let state = StateStore::open(&config).context("Failed to open state database")?;
        let notifier = Notifier::new(&config).context("Failed to create notifier")?;

        Ok(Self {
            config,
            netbox,
            collector,
            correlator,
            state,
            notifier,
            shutdown,
        })
    }

    /// Update state for each event, manage the drift tag and send alerts
    /// for confirmed moves.
    async fn process_events(&mut self, events: Vec<MoveEvent>) -> Result<()> {
        let confirm_threshold = self.config.move_confirm_runs;
        let move_tag = self.config.move_tag_name.clone();

        for mut event in events {
            // Finish the current event, then honor a pending shutdown
            if self.shutdown.load(Ordering::SeqCst) {
                log::info!("Shutdown requested, stopping event processing");
                break;
            }

            let counter = self.state.update_state(&event)?;
            let device_id = event.server.interface.device_id;

            if matches!(event.status, MoveStatus::Ok | MoveStatus::OkMlagPeer) {
                // Back on the expected endpoint: drop the drift tag
                if let Err(err) = self.netbox.remove_tag(device_id, &move_tag).await {
                    log::warn!(
                        "Failed to remove tag from {}: {:#}",
                        event.server.server_name(),
                        err
                    );
                }
                continue;
            }

            if event.status != MoveStatus::MoveDetected {
                continue;
            }

            event.consecutive_count = counter;

            if counter < confirm_threshold {
                log::info!(
                    "Move detected for {}, waiting for confirmation ({}/{})",
                    event.server.server_name(),
                    counter,
                    confirm_threshold
                );
                continue;
            }

            event.status = MoveStatus::MoveConfirmed;
            log::warn!(
                "Move CONFIRMED for {} after {} consecutive observations: expected {}, observed {}",
                event.server.server_name(),
                counter,
                event
                    .expected
                    .as_ref()
                    .map(|e| format!("{}:{}", e.switch_name, e.port_name))
                    .unwrap_or_else(|| "unknown".to_string()),
                event
                    .observed
                    .as_ref()
                    .map(|o| format!("{}:{}", o.switch_name, o.port_name))
                    .unwrap_or_else(|| "unknown".to_string()),
            );

            if let Err(err) = self.netbox.add_tag(device_id, &move_tag).await {
                log::warn!(
                    "Failed to add tag to {}: {:#}",
                    event.server.server_name(),
                    err
                );
            }

            let (send, is_reminder) = self
                .state
                .should_send_alert(event.server.mac(), event.observed.as_ref())?;
            if !send {
                log::debug!(
                    "Alert for {} suppressed (sent recently)",
                    event.server.server_name()
                );
                continue;
            }

            let first_detected = self
                .state
                .get_first_move_time(event.server.mac())?
                .unwrap_or_else(Utc::now);

            let alert = AlertInfo {
                server_name: event.server.server_name().to_string(),
                server_url: event.server.interface.device_url.clone(),
                mac_address: event.server.mac().to_string(),
                ip_address: event.server.interface.ip_address.clone(),
                expected_switch: event
                    .expected
                    .as_ref()
                    .map(|e| e.switch_name.clone())
                    .unwrap_or_else(|| "Unknown".to_string()),
                expected_port: event
                    .expected
                    .as_ref()
                    .map(|e| e.port_name.clone())
                    .unwrap_or_else(|| "Unknown".to_string()),
                expected_url: event.expected.as_ref().and_then(|e| e.switch_url.clone()),
                observed_switch: event
                    .observed
                    .as_ref()
                    .map(|o| o.switch_name.clone())
                    .unwrap_or_else(|| "Unknown".to_string()),
                observed_port: event
                    .observed
                    .as_ref()
                    .map(|o| o.port_name.clone())
                    .unwrap_or_else(|| "Unknown".to_string()),
                observed_vlan: event.observed.as_ref().and_then(|o| o.vlan),
                consecutive_count: counter,
                first_detected,
                is_reminder,
            };

            match self.notifier.send_alert(device_id, &alert).await {
                Ok(()) => {
                    self.state
                        .record_alert(event.server.mac(), event.observed.as_ref(), is_reminder)?;
                    log::info!(
                        "Alert sent for {} (reminder: {})",
                        event.server.server_name(),
                        is_reminder
                    );
                }
                Err(err) => {
                    // Not recorded as sent; retried next cycle
                    log::error!(
                        "Failed to send alert for {}: {:#}",
                        event.server.server_name(),
                        err
                    );
                }
            }
        }

        Ok(())
    }

    /// One end-to-end poll cycle.
    async fn run_cycle(&mut self) -> Result<()> {
        log::info!("Starting poll cycle");
        let cycle_start = Instant::now();

        let servers = self.netbox.list_servers_with_ipmi().await?;
        if servers.is_empty() {
            log::warn!("No servers with IPMI interfaces found");
            return Ok(());
        }

        let switches = self.netbox.list_switches().await?;
        if switches.is_empty() {
            log::warn!("No switches found for FDB collection");
            return Ok(());
        }

        let fdb = self.collector.collect_all(&switches).await;
        let successful = fdb.values().filter(|f| f.error.is_none()).count();
        log::info!(
            "FDB collection complete: {}/{} switches successful",
            successful,
            switches.len()
        );

        let events = self.correlator.correlate(&servers, &fdb);
        let mut status_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for event in &events {
            *status_counts.entry(event.status.as_str()).or_default() += 1;
        }
        log::info!(
            "Correlation complete: {} MACs, {:?}",
            events.len(),
            status_counts
        );

        self.process_events(events).await?;

        log::info!(
            "Poll cycle complete in {:.2}s",
            cycle_start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Sleep in small increments, returning early once shutdown is flagged.
    async fn sleep_interruptible(&self, total: Duration) {
        let mut remaining = total;
        while remaining > Duration::ZERO && !self.shutdown.load(Ordering::SeqCst) {
            let step = remaining.min(SLEEP_STEP);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }

    /// The main poll loop; returns once shutdown is requested.
    async fn run(&mut self) -> Result<()> {
        log::info!(
            "Starting IPMI move auditor (poll interval {}s, confirmation after {} runs)",
            self.config.poll_interval,
            self.config.move_confirm_runs
        );

        self.notifier.send_startup_notification();

        let deleted = self
            .state
            .cleanup_old_alerts(ALERT_RETENTION_DAYS)
            .context("Failed to clean up alert history")?;
        if deleted > 0 {
            log::info!("Cleaned up {deleted} old alert records");
        }

        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(err) = self.run_cycle().await {
                log::error!("Error in poll cycle: {err:#}");
                self.notifier.send_error_notification(&format!("{err:#}"));
                self.sleep_interruptible(Duration::from_secs(ERROR_BACKOFF_SECS))
                    .await;
                continue;
            }

            log::debug!("Sleeping for {} seconds", self.config.poll_interval);
            self.sleep_interruptible(Duration::from_secs(self.config.poll_interval))
                .await;
        }

        log::info!("Auditor shutdown complete");
        Ok(())
    }
}

fn main() -> Result<()> {
    // Small bounded runtime: one worker for the poll loop, one for the
    // signal task and HTTP; SNMP runs on the blocking pool
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("ipmi-auditor")
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.env_file {
        config::load_env_file(path)?;
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Fatal configuration error: {err:#}");
            std::process::exit(1);
        }
    };

    logging::setup_logging(&config.log_level, config.log_format);

    // Signal handlers flip a shared flag; the sleep loop and the event
    // loop observe it
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => log::info!("Received SIGTERM, shutting down..."),
                _ = sigint.recv() => log::info!("Received SIGINT, shutting down..."),
            }
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    let mut auditor = Auditor::new(config, Arc::clone(&shutdown))?;
    auditor.run().await
}
