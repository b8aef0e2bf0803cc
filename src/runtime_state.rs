// =============================================================================
// RuntimeState — per-side mutable lifecycle state (C3: Side State Machine)
// =============================================================================
//
// States: Idle, WaitingLimit, Armed, Closing, HedgeLocked. The lifecycle is
// never stored redundantly — it is always derived from the flag combination
// below, so there is exactly one source of truth and no risk of the two
// drifting apart (§9: "tagged variants ... closed enumerations with explicit
// branches", applied here as a derived read rather than a stored field).
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Execution stats for one filled grid row, keyed by row index. `BTreeMap`
/// serializes as a JSON object with stringified integer keys, matching §6's
/// "keys of exec_map are stringified indices" with no custom codec needed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RowExecStats {
    pub index: u32,
    pub entry_price: f64,
    pub lots: f64,
    pub profit: f64,
    pub timestamp: f64,
}

/// The five lifecycle states a side can be in, derived from `RuntimeState`'s
/// flags. Exposed to the read-model so the UI doesn't need to reimplement
/// the derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideLifecycle {
    Idle,
    WaitingLimit,
    Armed,
    Closing,
    HedgeLocked,
}

/// Per-side mutable runtime state, persisted verbatim across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub on: bool,
    /// `{side}_{8-hex}` or empty; identifies a contiguous accumulation cycle.
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub waiting_limit: bool,
    #[serde(default)]
    pub is_closing: bool,
    #[serde(default)]
    pub hedge_triggered: bool,
    #[serde(default)]
    pub exec_map: BTreeMap<u32, RowExecStats>,
    #[serde(default)]
    pub start_ref: f64,
    /// Equity captured at row-0 fill, used for `equity_pct` TP targets.
    /// `None` until row 0 actually fills this session.
    #[serde(default)]
    pub equity_at_arm: Option<f64>,
    /// UNIX seconds (float) of the most recent order emission; 0 if never.
    #[serde(default)]
    pub last_order_sent_ts: f64,
    /// Row index of the most recently emitted, not-yet-confirmed order, if
    /// any. Used to tell "still waiting on the broker to ack the row we just
    /// fired" apart from "a new row now separately qualifies" — both can
    /// otherwise look identical to a pure elapsed-time check (§4.7).
    #[serde(default)]
    pub last_fired_index: Option<u32>,
    /// Whether a cyclic re-arm is allowed once this closing session drains.
    /// False when the side was stopped by the operator or by emergency
    /// close; true when it reached Closing via its own take-profit.
    #[serde(default = "default_true")]
    pub auto_restart_eligible: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            on: false,
            session_id: String::new(),
            waiting_limit: false,
            is_closing: false,
            hedge_triggered: false,
            exec_map: BTreeMap::new(),
            start_ref: 0.0,
            equity_at_arm: None,
            last_order_sent_ts: 0.0,
            last_fired_index: None,
            auto_restart_eligible: true,
        }
    }
}

impl RuntimeState {
    /// Aggregate unrealized profit across every executing row on this side.
    pub fn side_profit(&self) -> f64 {
        self.exec_map.values().map(|s| s.profit).sum()
    }

    /// Aggregate lots across every executing row on this side.
    pub fn side_volume(&self) -> f64 {
        self.exec_map.values().map(|s| s.lots).sum()
    }

    /// Next grid row index to fire (= number of rows already executing).
    pub fn next_index(&self) -> u32 {
        self.exec_map.len() as u32
    }

    /// The bare 8-hex hash portion of `session_id` (which is stored as
    /// `{side}_{hash}`), or empty if there is no active session.
    pub fn session_hash(&self) -> &str {
        if self.session_id.is_empty() {
            ""
        } else {
            self.session_id.rsplit('_').next().unwrap_or("")
        }
    }

    /// Derive the lifecycle state from the current flags (§4.3). `is_closing`
    /// is checked ahead of `hedge_triggered` so that an emergency close
    /// issued against a hedge-locked side reads as `Closing` immediately,
    /// even though `hedge_triggered` itself is only cleared once the session
    /// fully drains.
    pub fn lifecycle(&self) -> SideLifecycle {
        if self.is_closing {
            SideLifecycle::Closing
        } else if self.hedge_triggered {
            SideLifecycle::HedgeLocked
        } else if !self.on && self.session_id.is_empty() {
            SideLifecycle::Idle
        } else if self.waiting_limit {
            SideLifecycle::WaitingLimit
        } else if !self.session_id.is_empty() {
            SideLifecycle::Armed
        } else {
            SideLifecycle::Idle
        }
    }

    /// §7: sync-shield predicate — true while an order is still considered
    /// "in flight" for this side.
    pub fn in_flight(&self, now: f64) -> bool {
        self.last_order_sent_ts > 0.0 && (now - self.last_order_sent_ts) < 5.0
    }

    /// Reset to a brand-new, idle-off state while preserving nothing —
    /// used when a session fully drains and the side is not re-armed.
    pub fn clear_session(&mut self) {
        self.session_id.clear();
        self.waiting_limit = false;
        self.is_closing = false;
        self.hedge_triggered = false;
        self.exec_map.clear();
        self.start_ref = 0.0;
        self.equity_at_arm = None;
        self.last_order_sent_ts = 0.0;
        self.last_fired_index = None;
        self.auto_restart_eligible = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_idle() {
        assert_eq!(RuntimeState::default().lifecycle(), SideLifecycle::Idle);
    }

    #[test]
    fn hedge_locked_dominates_other_flags() {
        let mut rs = RuntimeState {
            on: true,
            session_id: "buy_a1b2c3d4".into(),
            ..Default::default()
        };
        rs.exec_map.insert(0, RowExecStats { index: 0, entry_price: 1.0, lots: 0.1, profit: -5.0, timestamp: 0.0 });
        rs.hedge_triggered = true;
        assert_eq!(rs.lifecycle(), SideLifecycle::HedgeLocked);
    }

    #[test]
    fn in_flight_predicate_respects_five_second_window() {
        let rs = RuntimeState { last_order_sent_ts: 10.0, ..Default::default() };
        assert!(rs.in_flight(11.0));
        assert!(rs.in_flight(14.9));
        assert!(!rs.in_flight(15.0));
        assert!(!rs.in_flight(15.5));
    }

    #[test]
    fn never_sent_is_never_in_flight() {
        let rs = RuntimeState::default();
        assert!(!rs.in_flight(1000.0));
    }
}
