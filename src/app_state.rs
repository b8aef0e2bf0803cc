// =============================================================================
// AppState — Read-Model & Control Surface (C6)
// =============================================================================
//
// The single source of truth for the running engine. All HTTP handlers go
// through this type; it owns the one `Mutex<Engine>` that gives the engine
// its single-writer guarantee (§5) and exposes read-consistent snapshots for
// the UI without ever handing out a torn read.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::{Engine, LogEntry, TickInput, TickOutcome};
use crate::error::EngineError;
use crate::settings::UserSettings;
use crate::side_engine::SideEngine;
use crate::state_store;
use crate::types::Side;

/// Central application state shared across the API via `Arc<AppState>`.
pub struct AppState {
    engine: Mutex<Engine>,
    state_path: String,
    /// The single symbol this instance trades (`ENGINE_SYMBOL`); informational
    /// only, echoed verbatim in `UiSnapshot` (SPEC_FULL §4.9).
    symbol: String,
    /// Monotonically increasing counter, bumped on every committed mutation —
    /// lets the UI cheaply detect "has anything changed since I last asked".
    version: AtomicU64,
}

/// Read-only projection of a side's runtime flags, shaped for the UI.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeView {
    pub on: bool,
    pub session_id: String,
    pub waiting_limit: bool,
    pub is_closing: bool,
    pub hedge_triggered: bool,
    pub exec_map: std::collections::BTreeMap<u32, crate::runtime_state::RowExecStats>,
    pub side_profit: f64,
    pub side_volume: f64,
    pub start_ref: f64,
    pub equity_at_arm: Option<f64>,
    pub last_order_sent_ts: f64,
}

impl From<&crate::runtime_state::RuntimeState> for RuntimeView {
    fn from(rt: &crate::runtime_state::RuntimeState) -> Self {
        Self {
            on: rt.on,
            session_id: rt.session_id.clone(),
            waiting_limit: rt.waiting_limit,
            is_closing: rt.is_closing,
            hedge_triggered: rt.hedge_triggered,
            exec_map: rt.exec_map.clone(),
            side_profit: rt.side_profit(),
            side_volume: rt.side_volume(),
            start_ref: rt.start_ref,
            equity_at_arm: rt.equity_at_arm,
            last_order_sent_ts: rt.last_order_sent_ts,
        }
    }
}

/// Read-only projection of one side, shaped for the UI (Endpoint B, §6).
#[derive(Debug, Clone, Serialize)]
pub struct SideSnapshot {
    pub settings: UserSettings,
    pub lifecycle: crate::runtime_state::SideLifecycle,
    pub runtime: RuntimeView,
}

/// Full engine snapshot returned by `GET /api/ui-data`.
#[derive(Debug, Clone, Serialize)]
pub struct UiSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub symbol: String,
    pub cyclic_on: bool,
    /// Single user-visible health string; empty means healthy (§7).
    pub error_status: String,
    pub market: crate::types::MarketSnapshot,
    pub buy: SideSnapshot,
    pub sell: SideSnapshot,
    pub recent_actions: Vec<LogEntry>,
    pub recent_errors: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlResult {
    pub accepted: bool,
    pub message: String,
}

impl AppState {
    /// Construct state by loading `state_path`, falling back to a fresh
    /// engine (with a warning) when the file is missing or unreadable.
    pub fn new(state_path: String, symbol: String) -> Self {
        let engine = state_store::load_or_default(&state_path);
        Self {
            engine: Mutex::new(engine),
            state_path,
            symbol,
            version: AtomicU64::new(1),
        }
    }

    fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst)
    }

    fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Public accessor for the liveness probe (Endpoint health, ambient).
    pub fn state_version(&self) -> u64 {
        self.current_version()
    }

    /// Force one last persistence write, matching the teacher's shutdown
    /// pattern of saving its config once more before exiting (§5: "Shutdown
    /// drains the queue then persists once more").
    pub fn persist_now(&self) {
        let mut engine = self.engine.lock();
        self.persist(&mut engine);
    }

    /// Persist `engine` and reconcile the latched persistence warning
    /// (never touches an identity-conflict message — that only clears via
    /// emergency close, per §7).
    fn persist(&self, engine: &mut Engine) {
        match state_store::save(engine, &self.state_path) {
            Ok(()) => {
                if engine.error_status.starts_with("persist:") {
                    engine.error_status.clear();
                }
            }
            Err(e) => {
                warn!(error = %e, path = %self.state_path, "failed to persist engine state");
                if engine.error_status.is_empty() {
                    engine.error_status = format!("persist: {e}");
                }
            }
        }
    }

    /// Endpoint A: run one heartbeat through the decision engine, then
    /// persist. Persistence happens on every tick because the engine has no
    /// other durable record of a fired action between heartbeats.
    pub fn process_tick(&self, tick: &TickInput, now: f64) -> TickOutcome {
        let mut engine = self.engine.lock();
        let outcome = engine.process_tick(tick, now);
        self.persist(&mut engine);
        drop(engine);
        self.bump_version();
        outcome
    }

    /// Endpoint B: a read-consistent snapshot for the UI.
    pub fn snapshot(&self) -> UiSnapshot {
        let engine = self.engine.lock();
        build_snapshot_locked(&engine, self.current_version(), &self.symbol)
    }

    /// Endpoint C: validate then apply a settings update for one side.
    ///
    /// A payload that only flips `rows[*].alert` flags bypasses the shrink
    /// check entirely — §6 "Clearing a row's alert flag is always allowed",
    /// independent of whatever else the acceptance rules would otherwise
    /// reject it for.
    pub fn update_settings(&self, side: Side, new_settings: UserSettings) -> Result<UiSnapshot, EngineError> {
        let mut engine = self.engine.lock();
        let current = engine.side(side).settings.clone();

        if !current.differs_only_by_alert(&new_settings) {
            let min_rows = engine.side(side).runtime.exec_map.len();
            new_settings.validate(min_rows)?;
        }

        engine.apply_settings(side, new_settings);
        self.persist(&mut engine);
        let snapshot = build_snapshot_locked(&engine, self.current_version(), &self.symbol);
        drop(engine);
        self.bump_version();
        info!(side = %side, "settings updated");
        Ok(snapshot)
    }

    /// Endpoint D: operator control surface (on/off, cyclic, emergency).
    ///
    /// Every command present on the incoming request is applied here inside
    /// a single lock acquisition, in the caller's order, followed by exactly
    /// one persist and one version bump — §5 "all mutations ... are funneled
    /// through one ordered queue and applied one at a time" and §6 Endpoint D
    /// "each field ... is applied in that order within one event." Locking
    /// once per *command* instead of once per *request* would let a tick or
    /// another control call interleave between, say, `buy_switch` and
    /// `emergency_close` on the same request, tearing the event apart.
    pub fn apply_control_batch(&self, cmds: &[ControlCommand], now: f64) -> ControlResult {
        let mut engine = self.engine.lock();
        for &cmd in cmds {
            match cmd {
                ControlCommand::SetSideOn { side, on } => {
                    engine.set_side_on(side, on, now);
                    info!(side = %side, on, "operator toggled side");
                }
                ControlCommand::SetCyclic { on } => {
                    engine.set_cyclic(on);
                    info!(on, "operator toggled cyclic mode");
                }
                ControlCommand::EmergencyClose => {
                    engine.emergency_close(now);
                    warn!("operator issued emergency close");
                }
            }
        }
        self.persist(&mut engine);
        drop(engine);
        self.bump_version();
        if cmds.is_empty() {
            ControlResult { accepted: true, message: "no fields present, nothing applied".to_string() }
        } else {
            ControlResult { accepted: true, message: "applied".to_string() }
        }
    }
}

/// One operator control-surface command (Endpoint D, §6).
#[derive(Debug, Clone, Copy)]
pub enum ControlCommand {
    SetSideOn { side: Side, on: bool },
    SetCyclic { on: bool },
    EmergencyClose,
}

fn side_snapshot(se: &SideEngine) -> SideSnapshot {
    SideSnapshot {
        settings: se.settings.clone(),
        lifecycle: se.runtime.lifecycle(),
        runtime: RuntimeView::from(&se.runtime),
    }
}

fn build_snapshot_locked(engine: &Engine, version: u64, symbol: &str) -> UiSnapshot {
    UiSnapshot {
        state_version: version,
        server_time: Utc::now().timestamp_millis(),
        symbol: symbol.to_string(),
        cyclic_on: engine.cyclic_on,
        error_status: engine.error_status.clone(),
        market: engine.market,
        buy: side_snapshot(&engine.buy),
        sell: side_snapshot(&engine.sell),
        recent_actions: engine.recent_actions.iter().cloned().collect(),
        recent_errors: engine.recent_errors.iter().cloned().collect(),
    }
}
