//! Lifecycle controller
//!
//! Keeps at most one live engine per configured instrument. Each control
//! pass first retires terminated engines, then proposes and executes stop,
//! refresh and create actions in that order.

mod actions;

pub use actions::{ControllerAction, StopReason};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ConfigUpdate};
use crate::domain::InstrumentId;
use crate::error::{GridError, Result};
use crate::exchange::{ExecutionAdapter, MarketDataProvider};
use crate::grid::{
    spawn_engine, EngineContext, EngineHandle, EngineReport, EngineSnapshot, GridEngine,
    GridThresholds, ShutdownNotice, ShutdownNotifier,
};
use crate::signal::SignalRegistry;

/// How often the shutdown drain re-checks engine tasks between notices
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct GridController {
    config: AppConfig,
    exchange: Arc<dyn ExecutionAdapter>,
    market_data: Arc<dyn MarketDataProvider>,
    registry: SignalRegistry,
    engines: BTreeMap<InstrumentId, EngineHandle>,
    /// Engines already asked to drain
    stopping: BTreeSet<InstrumentId>,
    feeds: BTreeSet<InstrumentId>,
    closed: VecDeque<EngineReport>,
    notice_tx: mpsc::Sender<ShutdownNotice>,
    notice_rx: mpsc::Receiver<ShutdownNotice>,
}

impl GridController {
    pub fn new(
        config: AppConfig,
        exchange: Arc<dyn ExecutionAdapter>,
        market_data: Arc<dyn MarketDataProvider>,
        registry: SignalRegistry,
    ) -> Self {
        let (notice_tx, notice_rx) =
            mpsc::channel(config.controller.shutdown_queue_capacity.max(1));
        Self {
            config,
            exchange,
            market_data,
            registry,
            engines: BTreeMap::new(),
            stopping: BTreeSet::new(),
            feeds: BTreeSet::new(),
            closed: VecDeque::new(),
            notice_tx,
            notice_rx,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn live_instruments(&self) -> Vec<InstrumentId> {
        self.engines.keys().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<EngineSnapshot> {
        self.engines.values().map(EngineHandle::snapshot).collect()
    }

    /// Most recent reports of terminated engines, oldest first
    pub fn closed_reports(&self) -> impl Iterator<Item = &EngineReport> {
        self.closed.iter()
    }

    pub fn active_feeds(&self) -> Vec<InstrumentId> {
        self.feeds.iter().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------

    /// Configured instruments without a live engine
    pub fn create_actions(&self) -> Vec<ControllerAction> {
        self.config
            .instruments()
            .into_iter()
            .filter(|id| !self.engines.contains_key(id))
            .map(ControllerAction::Create)
            .collect()
    }

    /// Live engines whose instrument is no longer configured
    pub fn stop_actions(&self) -> Vec<ControllerAction> {
        let configured: BTreeSet<_> = self.config.instruments().into_iter().collect();
        self.engines
            .keys()
            .filter(|id| !configured.contains(*id) && !self.stopping.contains(*id))
            .map(|id| ControllerAction::Stop {
                instrument: id.clone(),
                reason: StopReason::Descoped,
            })
            .collect()
    }

    /// Idle engines whose last action is older than the refresh interval
    pub fn refresh_actions(&self, now: DateTime<Utc>) -> Vec<ControllerAction> {
        let interval = self.config.controller.refresh_interval_secs;
        if interval == 0 {
            return Vec::new();
        }
        let max_idle = chrono::Duration::seconds(i64::try_from(interval).unwrap_or(i64::MAX));

        self.engines
            .iter()
            .filter(|(id, _)| !self.stopping.contains(*id))
            .filter(|(_, handle)| {
                let snapshot = handle.snapshot();
                !snapshot.is_trading
                    && !snapshot.status.is_terminal()
                    && now - snapshot.last_action_at >= max_idle
            })
            .map(|(id, _)| ControllerAction::Stop {
                instrument: id.clone(),
                reason: StopReason::Refresh,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    pub async fn execute_action(&mut self, action: &ControllerAction) -> Result<()> {
        match action {
            ControllerAction::Create(instrument) => self.create_engine(instrument).await,
            ControllerAction::Stop { instrument, reason } => {
                let handle = self.engines.get(instrument).ok_or_else(|| {
                    GridError::Internal(format!("no live engine for {instrument}"))
                })?;
                match reason {
                    StopReason::Descoped => {
                        info!(%instrument, "Instrument descoped, stopping engine");
                        handle.early_stop()?;
                        self.stopping.insert(instrument.clone());
                    }
                    StopReason::Refresh => {
                        info!(%instrument, "Refreshing idle engine");
                        handle.refresh()?;
                    }
                }
                Ok(())
            }
        }
    }

    async fn create_engine(&mut self, instrument: &InstrumentId) -> Result<()> {
        let params = self
            .config
            .pair_params(&instrument.pair)
            .ok_or_else(|| GridError::Validation(format!("no params for {}", instrument.pair)))?;
        let thresholds = GridThresholds::from_params(params);
        thresholds.validate()?;
        let signal = self.registry.resolve(&params.signal.name)?;
        let signal_params = params.signal.signal_params();

        self.market_data
            .start_feed(instrument, &thresholds.signal_interval, thresholds.max_records)
            .await?;
        self.feeds.insert(instrument.clone());

        let context = EngineContext {
            instrument: instrument.clone(),
            thresholds,
            settings: self.config.engine.clone(),
            signal,
            signal_params,
        };
        let notifier = ShutdownNotifier::new(
            self.notice_tx.clone(),
            Duration::from_millis(self.config.controller.shutdown_notify_timeout_ms),
        );
        let engine = GridEngine::new(context, self.exchange.clone(), self.market_data.clone())
            .with_notifier(notifier);

        info!(%instrument, side = %params.side, signal = %params.signal.name, "Engine created");
        self.engines.insert(instrument.clone(), spawn_engine(engine));
        Ok(())
    }

    /// One controller iteration; returns the actions that were executed
    pub async fn control_pass(&mut self, now: DateTime<Utc>) -> Vec<ControllerAction> {
        self.drain_notices().await;
        self.reap_finished().await;

        let mut actions = self.stop_actions();
        actions.extend(self.refresh_actions(now));
        actions.extend(self.create_actions());

        let mut executed = Vec::with_capacity(actions.len());
        for action in actions {
            match self.execute_action(&action).await {
                Ok(()) => executed.push(action),
                Err(e) => warn!(%action, "Controller action failed: {}", e),
            }
        }
        executed
    }

    // ------------------------------------------------------------------
    // Engine termination
    // ------------------------------------------------------------------

    async fn drain_notices(&mut self) {
        while let Ok(notice) = self.notice_rx.try_recv() {
            self.on_notice(notice).await;
        }
    }

    async fn on_notice(&mut self, notice: ShutdownNotice) {
        // A notice may trail an engine already reaped and replaced
        let current = self
            .engines
            .get(&notice.instrument)
            .is_some_and(|h| h.snapshot().created_at == notice.report.snapshot.created_at);
        if !current {
            debug!(instrument = %notice.instrument, "Notice for a retired engine ignored");
            return;
        }
        info!(
            instrument = %notice.instrument,
            close_type = ?notice.close_type,
            session_pnl = %notice.report.snapshot.session_pnl,
            "Engine shut down"
        );
        self.engines.remove(&notice.instrument);
        self.retire(&notice.instrument, notice.report).await;
    }

    /// Engines that finished without a notice reaching us
    async fn reap_finished(&mut self) {
        let finished: Vec<InstrumentId> = self
            .engines
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for instrument in finished {
            let Some(handle) = self.engines.remove(&instrument) else {
                continue;
            };
            match handle.join().await {
                Ok(report) => {
                    warn!(%instrument, close_type = ?report.snapshot.close_type, "Engine finished without notice");
                    self.retire(&instrument, report).await;
                }
                Err(e) => {
                    error!(%instrument, "Engine task lost: {}", e);
                    self.stopping.remove(&instrument);
                    self.release_feed(&instrument).await;
                }
            }
        }
    }

    async fn retire(&mut self, instrument: &InstrumentId, report: EngineReport) {
        self.stopping.remove(instrument);
        self.release_feed(instrument).await;
        self.closed.push_back(report);
        while self.closed.len() > self.config.controller.closed_engines_buffer {
            self.closed.pop_front();
        }
    }

    async fn release_feed(&mut self, instrument: &InstrumentId) {
        if !self.feeds.remove(instrument) {
            return;
        }
        if let Err(e) = self.market_data.stop_feed(instrument).await {
            warn!(%instrument, "Failed to stop feed: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Apply a new configuration snapshot and re-derive feed subscriptions
    pub async fn update_config(&mut self, new: &AppConfig) -> ConfigUpdate {
        let update = self.config.apply_update(new);
        if !update.applied.is_empty() {
            info!(fields = ?update.applied, "Configuration updated");
        }
        if !update.ignored.is_empty() {
            warn!(fields = ?update.ignored, "Changes to these sections need a restart");
        }
        self.sync_feeds().await;
        update
    }

    async fn sync_feeds(&mut self) {
        let configured: BTreeSet<_> = self.config.instruments().into_iter().collect();

        for instrument in &configured {
            let Some(params) = self.config.pair_params(&instrument.pair) else {
                warn!(%instrument, "No params configured, feed not started");
                continue;
            };
            match self
                .market_data
                .start_feed(instrument, &params.interval, params.max_records)
                .await
            {
                Ok(()) => {
                    self.feeds.insert(instrument.clone());
                }
                Err(e) => warn!(%instrument, "Failed to start feed: {}", e),
            }
        }

        let unused: Vec<InstrumentId> = self
            .feeds
            .iter()
            .filter(|id| !configured.contains(*id) && !self.engines.contains_key(*id))
            .cloned()
            .collect();
        for instrument in unused {
            self.release_feed(&instrument).await;
        }
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    pub async fn run(
        &mut self,
        mut config_updates: watch::Receiver<AppConfig>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = Duration::from_millis(self.config.controller.control_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut updates_open = true;

        info!(
            markets = ?self.config.controller.markets,
            interval_ms = self.config.controller.control_interval_ms,
            "Controller started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let executed = self.control_pass(Utc::now()).await;
                    if !executed.is_empty() {
                        debug!(actions = executed.len(), live = self.engines.len(), "Control pass done");
                    }
                }
                changed = config_updates.changed(), if updates_open => {
                    if changed.is_ok() {
                        let new = config_updates.borrow_and_update().clone();
                        self.update_config(&new).await;
                    } else {
                        debug!("Configuration source closed");
                        updates_open = false;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let grace = Duration::from_secs(self.config.controller.shutdown_grace_secs);
        self.shutdown(grace).await;
    }

    /// Early-stop every engine and wait up to `grace` for them to drain
    pub async fn shutdown(&mut self, grace: Duration) {
        info!(live = self.engines.len(), "Stopping all engines");
        for (instrument, handle) in &self.engines {
            if let Err(e) = handle.early_stop() {
                warn!(%instrument, "Early stop not delivered: {}", e);
            }
            self.stopping.insert(instrument.clone());
        }

        let deadline = Instant::now() + grace;
        while !self.engines.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                error!(
                    remaining = ?self.live_instruments(),
                    "Shutdown grace period elapsed with engines still draining"
                );
                break;
            }
            match tokio::time::timeout(remaining.min(SHUTDOWN_POLL_INTERVAL), self.notice_rx.recv())
                .await
            {
                Ok(Some(notice)) => self.on_notice(notice).await,
                Ok(None) => break,
                Err(_) => self.reap_finished().await,
            }
        }
        self.reap_finished().await;
        info!(closed = self.closed.len(), "Controller stopped");
    }
}
