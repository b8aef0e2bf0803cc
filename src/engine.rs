// =============================================================================
// Decision Engine (C4) — the per-tick reducer
// =============================================================================
//
// `Engine::process_tick` is the single entry point for the heartbeat. It runs
// the nine-step pipeline from §4.4 for both sides, then resolves at most one
// action across them. Everything here is synchronous and side-effect-free
// apart from mutating `self` — the caller (the app-state layer) is
// responsible for serializing calls so there is one writer at a time (§5).
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::hedge;
use crate::identity;
use crate::runtime_state::RowExecStats;
use crate::settings::UserSettings;
use crate::side_engine::SideEngine;
use crate::types::{Action, MarketSnapshot, Side, TpType};

const MAX_LOG_ENTRIES: usize = 200;

/// One broker-reported open position, as carried on the heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInput {
    #[serde(default)]
    pub ticket: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub volume: f64,
    pub price: f64,
    pub profit: f64,
    #[serde(default)]
    pub comment: String,
}

/// The heartbeat payload (Endpoint A, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct TickInput {
    pub equity: f64,
    pub balance: f64,
    pub ask: f64,
    pub bid: f64,
    #[serde(default)]
    pub positions: Vec<PositionInput>,
}

/// The engine's reply to a tick (Endpoint A response, §6).
#[derive(Debug, Clone, Serialize)]
pub struct TickOutcome {
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<bool>,
}

impl TickOutcome {
    fn wait() -> Self {
        Self { action: Action::Wait, volume: None, comment: None, alert: None }
    }
}

#[derive(Debug, Clone)]
struct FireCandidate {
    side: Side,
    row_index: u32,
    volume: f64,
    alert: bool,
    entry_price: f64,
    clears_waiting_limit: bool,
}

#[derive(Debug, Clone)]
struct ClosingCandidate {
    side: Side,
}

/// A bounded log entry kept for the read-model (§6 C6, SPEC_FULL §11 C11).
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: f64,
    pub message: String,
}

/// The full decision engine — both sides, the shared market snapshot, and
/// ambient diagnostics for the read-model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    pub buy: SideEngine,
    pub sell: SideEngine,
    #[serde(default)]
    pub cyclic_on: bool,
    /// Single user-visible health string; empty means healthy (§7). Latched
    /// by an identity conflict or a persistence-write failure; cleared by
    /// emergency close (identity conflicts) or the next successful write
    /// (persistence warnings).
    #[serde(default)]
    pub error_status: String,
    #[serde(default)]
    pub market: MarketSnapshot,
    #[serde(skip, default)]
    pub recent_actions: VecDeque<LogEntry>,
    #[serde(skip, default)]
    pub recent_errors: VecDeque<LogEntry>,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            buy: SideEngine::default(),
            sell: SideEngine::default(),
            cyclic_on: false,
            error_status: String::new(),
            market: MarketSnapshot::default(),
            recent_actions: VecDeque::new(),
            recent_errors: VecDeque::new(),
        }
    }
}

impl Engine {
    pub fn side(&self, side: Side) -> &SideEngine {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut SideEngine {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }

    fn push_log(log: &mut VecDeque<LogEntry>, now: f64, message: String) {
        log.push_back(LogEntry { timestamp: now, message });
        while log.len() > MAX_LOG_ENTRIES {
            log.pop_front();
        }
    }

    fn record_action(&mut self, now: f64, message: String) {
        Self::push_log(&mut self.recent_actions, now, message);
    }

    fn record_error(&mut self, now: f64, message: String) {
        Self::push_log(&mut self.recent_errors, now, message);
    }

    /// Force both sides into Closing. The caller's next tick(s) will drain
    /// and emit CLOSE_ALL for whichever side still reports positions (§4.6).
    pub fn emergency_close(&mut self, now: f64) {
        for side in [Side::Buy, Side::Sell] {
            let se = self.side_mut(side);
            se.runtime.is_closing = true;
            se.runtime.on = false;
            se.runtime.auto_restart_eligible = false;
        }
        // Emergency close is the only path that clears a latched identity
        // conflict (§7: "engine continues to emit WAIT ... until emergency
        // close clears both sides").
        self.error_status.clear();
        warn!("emergency close: both sides forced to Closing, error_status cleared");
        self.record_action(now, "emergency close: both sides forced to Closing".to_string());
    }

    /// Operator control surface (C6, Endpoint D): toggle a side on/off.
    pub fn set_side_on(&mut self, side: Side, on: bool, now: f64) {
        let se = self.side_mut(side);
        if on {
            if se.runtime.session_id.is_empty() {
                se.runtime.on = true;
                se.runtime.auto_restart_eligible = true;
                arm_fresh_session(se, side);
                info!(%side, session_id = %se.runtime.session_id, "operator armed side");
            } else {
                se.runtime.on = true;
                debug!(%side, "operator re-enabled already-sessioned side");
            }
        } else {
            se.runtime.on = false;
            // Only Idle/WaitingLimit/Armed transition straight to Closing on
            // an operator stop; a HedgeLocked side has no such edge in the
            // state diagram and simply records the flag.
            if !se.runtime.session_id.is_empty()
                && !se.runtime.hedge_triggered
                && !se.runtime.is_closing
            {
                se.runtime.is_closing = true;
                se.runtime.auto_restart_eligible = false;
                info!(%side, "operator stopped side with live session, draining to Closing");
            } else {
                debug!(%side, "operator stopped side");
            }
        }
    }

    pub fn set_cyclic(&mut self, on: bool) {
        self.cyclic_on = on;
    }

    /// Apply a validated settings update for one side.
    pub fn apply_settings(&mut self, side: Side, settings: UserSettings) {
        self.side_mut(side).settings = settings;
    }

    /// Run the full nine-step pipeline for one heartbeat and return exactly
    /// one action.
    pub fn process_tick(&mut self, tick: &TickInput, now: f64) -> TickOutcome {
        debug!(
            ask = tick.ask, bid = tick.bid, equity = tick.equity, balance = tick.balance,
            positions = tick.positions.len(), now, "tick ingested"
        );
        self.market = MarketSnapshot {
            ask: tick.ask,
            bid: tick.bid,
            equity: tick.equity,
            balance: tick.balance,
        };
        // Step 2: identity validation, per side.
        let mut conflicted = [false, false]; // [buy, sell]
        for pos in &tick.positions {
            let Some(tag) = identity::decode(&pos.comment) else {
                continue; // foreign position, not managed
            };
            let side_idx = match tag.side {
                Side::Buy => 0,
                Side::Sell => 1,
            };
            let rt = &self.side(tag.side).runtime;
            let expected_hash = rt.session_hash();
            if rt.session_id.is_empty() || expected_hash != tag.hash {
                conflicted[side_idx] = true;
                let detail = format!(
                    "position tagged {} does not match current session",
                    identity::encode(tag.side, &tag.hash, tag.index)
                );
                warn!(side = %tag.side, %detail, "identity conflict");
                self.record_error(now, format!("identity conflict: {detail}"));
                // Latch the first conflict only — it is cleared exclusively
                // by emergency close, not overwritten by later conflicts.
                if self.error_status.is_empty() {
                    self.error_status = format!("identity conflict: {detail}");
                }
            }
        }

        // Steps 3-9 per side, producing at most one fire candidate and one
        // closing candidate each, without committing fire side-effects yet.
        let mut fire_candidates: Vec<FireCandidate> = Vec::new();
        let mut closing_candidates: Vec<ClosingCandidate> = Vec::new();
        let mut hedge_plans: Vec<(Side, hedge::HedgePlan)> = Vec::new();

        for side in [Side::Buy, Side::Sell] {
            let side_idx = match side {
                Side::Buy => 0,
                Side::Sell => 1,
            };
            if conflicted[side_idx] {
                continue;
            }

            // Step 3: exec_map upsert from this tick's matching positions.
            update_exec_map(self.side_mut(side), side, &tick.positions, now);

            // Step 4: hedge check.
            if let Some(volume) = hedge_trigger_volume(self.side(side)) {
                let opposite = side.opposite();
                let plan = hedge::plan(self.side(opposite), opposite, volume, self.market);
                self.side_mut(side).runtime.hedge_triggered = true;
                warn!(
                    %side, volume, profit = self.side(side).runtime.side_profit(),
                    "hedge threshold breached, locking side and counter-injecting opposite"
                );
                hedge_plans.push((opposite, plan));
            }

            // Step 5: TP check, then closing-emission candidate.
            let balance = self.market.balance;
            check_take_profit(self.side_mut(side), side, balance);
            if self.side(side).runtime.is_closing && !self.side(side).runtime.exec_map.is_empty() {
                closing_candidates.push(ClosingCandidate { side });
            }

            // Step 6: external-close detection.
            apply_external_close(self, side, now);

            // Steps 7-8: expansion / waiting-limit fire candidate (deferred
            // commit — only applied if this candidate wins priority).
            if let Some(candidate) = compute_fire_candidate(self.side(side), side, self.market, now) {
                fire_candidates.push(candidate);
            }

            // Step 9: closing completion.
            complete_closing(self, side, now);
        }

        // Priority resolution: Closing (BUY before SELL) beats Expansion
        // (BUY before SELL) beats WAIT.
        closing_candidates.sort_by_key(|c| if c.side == Side::Buy { 0 } else { 1 });
        fire_candidates.sort_by_key(|c| if c.side == Side::Buy { 0 } else { 1 });

        let outcome = if let Some(c) = closing_candidates.first() {
            let session_id = self.side(c.side).runtime.session_id.clone();
            // CLOSE_ALL is an order emission too (§4.7) — refresh the
            // sync-shield timestamp so the grace window is measured from
            // this attempt, not a stale prior expansion fire.
            self.side_mut(c.side).runtime.last_order_sent_ts = now;
            self.record_action(now, format!("{}: CLOSE_ALL (closing)", c.side));
            TickOutcome {
                action: Action::CloseAll,
                volume: None,
                comment: Some(session_id),
                alert: None,
            }
        } else if let Some(c) = fire_candidates.first().cloned() {
            let equity = self.market.equity;
            commit_fire(self.side_mut(c.side), &c, now, equity);
            let action = match c.side {
                Side::Buy => Action::Buy,
                Side::Sell => Action::Sell,
            };
            let hash = self.side(c.side).runtime.session_hash().to_string();
            self.record_action(now, format!("{}: row {} fired", c.side, c.row_index));
            TickOutcome {
                action,
                volume: Some(c.volume),
                comment: Some(identity::encode(c.side, &hash, c.row_index)),
                alert: Some(c.alert),
            }
        } else {
            TickOutcome::wait()
        };

        // Apply deferred hedge injections, after this tick's own emission is
        // already decided, so they can never fire in the same tick.
        for (target_side, plan) in hedge_plans {
            let mut opposite = self.side(target_side).clone();
            hedge::apply(&mut opposite, target_side, plan, new_session_hash);
            *self.side_mut(target_side) = opposite;
            self.record_action(now, format!("{target_side}: hedge injection applied"));
        }

        outcome
    }
}

fn new_session_hash() -> String {
    let full = uuid::Uuid::new_v4().simple().to_string();
    full[..8].to_string()
}

fn arm_fresh_session(se: &mut SideEngine, side: Side) {
    se.runtime.session_id = format!("{side}_{}", new_session_hash());
    se.runtime.waiting_limit = se.settings.limit_price > 0.0;
    se.runtime.is_closing = false;
    se.runtime.hedge_triggered = false;
    se.runtime.exec_map.clear();
    se.runtime.start_ref = 0.0;
    se.runtime.equity_at_arm = None;
    se.runtime.last_order_sent_ts = 0.0;
    se.runtime.last_fired_index = None;
}

fn update_exec_map(se: &mut SideEngine, side: Side, positions: &[PositionInput], now: f64) {
    if se.runtime.session_id.is_empty() {
        return;
    }
    let expected_hash = se.runtime.session_hash().to_string();
    let mut seen = std::collections::BTreeSet::new();
    for pos in positions {
        let Some(tag) = identity::decode(&pos.comment) else { continue };
        if tag.side != side || tag.hash != expected_hash {
            continue;
        }
        seen.insert(tag.index);
        se.runtime.exec_map.insert(
            tag.index,
            RowExecStats {
                index: tag.index,
                entry_price: pos.price,
                lots: pos.volume,
                profit: pos.profit,
                timestamp: now,
            },
        );
    }
    se.runtime.exec_map.retain(|idx, _| seen.contains(idx));
}

/// Step 4 predicate: if this side has crossed its hedge loss threshold,
/// return the volume to hand to the opposite side's hedge controller.
fn hedge_trigger_volume(se: &SideEngine) -> Option<f64> {
    let rt = &se.runtime;
    if rt.hedge_triggered || rt.is_closing || se.settings.hedge_value <= 0.0 || rt.exec_map.is_empty() {
        return None;
    }
    if rt.side_profit() <= -se.settings.hedge_value {
        Some(rt.side_volume())
    } else {
        None
    }
}

fn check_take_profit(se: &mut SideEngine, side: Side, balance: f64) {
    let rt = &mut se.runtime;
    if rt.hedge_triggered || rt.is_closing || se.settings.tp_value <= 0.0 || rt.exec_map.is_empty() {
        return;
    }
    let profit = rt.side_profit();
    let target = match se.settings.tp_type {
        TpType::FixedMoney => se.settings.tp_value,
        TpType::EquityPct => rt.equity_at_arm.unwrap_or(0.0) * se.settings.tp_value / 100.0,
        TpType::BalancePct => balance * se.settings.tp_value / 100.0,
    };
    if profit >= target && target > 0.0 {
        rt.is_closing = true;
        rt.on = false;
        rt.auto_restart_eligible = true;
        info!(%side, profit, target, "take-profit target reached, side transitioning to Closing");
    }
}

fn apply_external_close(engine: &mut Engine, side: Side, now: f64) {
    let (should_rearm, cyclic) = {
        let se = engine.side(side);
        let rt = &se.runtime;
        // A session that has never fired an order yet (waiting on a limit,
        // or armed but row 0 hasn't filled) also has an empty exec_map and
        // last_order_sent_ts == 0 — that is not an external close, there was
        // never anything to close. Only treat zero positions as external
        // once at least one order has actually been sent.
        if rt.session_id.is_empty()
            || rt.is_closing
            || rt.exec_map.len() > 0
            || rt.in_flight(now)
            || rt.last_order_sent_ts <= 0.0
        {
            return;
        }
        (true, engine.cyclic_on)
    };
    if !should_rearm {
        return;
    }
    let se = engine.side_mut(side);
    if cyclic && se.runtime.on {
        arm_fresh_session(se, side);
        info!(%side, session_id = %se.runtime.session_id, "external close detected, cyclic re-arm");
    } else {
        se.runtime.clear_session();
        se.runtime.on = false;
        info!(%side, "external close detected, side idled");
    }
    engine.record_action(now, format!("{side}: zero positions outside the grace window"));
}

fn compute_fire_candidate(se: &SideEngine, side: Side, market: MarketSnapshot, now: f64) -> Option<FireCandidate> {
    let rt = &se.runtime;
    if rt.hedge_triggered || rt.is_closing {
        return None;
    }

    if rt.waiting_limit {
        let crossed = match side {
            Side::Buy => market.ask <= se.settings.limit_price,
            Side::Sell => market.bid >= se.settings.limit_price,
        };
        if !crossed {
            return None;
        }
        let row0 = se.settings.rows.get(0)?;
        let entry_price = match side {
            Side::Buy => market.ask,
            Side::Sell => market.bid,
        };
        return Some(FireCandidate {
            side,
            row_index: 0,
            volume: row0.lots,
            alert: row0.alert,
            entry_price,
            clears_waiting_limit: true,
        });
    }

    if rt.session_id.is_empty() {
        return None;
    }

    let k = rt.next_index();
    if k as usize >= se.settings.rows.len() {
        return None;
    }

    // Don't re-announce the row we just sent while its own confirmation is
    // still pending — otherwise every tick before the broker acks would
    // resend the same order (§4.7).
    if rt.last_fired_index == Some(k) && rt.in_flight(now) {
        return None;
    }

    if k == 0 {
        let row0 = &se.settings.rows[0];
        let entry_price = match side {
            Side::Buy => market.ask,
            Side::Sell => market.bid,
        };
        return Some(FireCandidate {
            side,
            row_index: 0,
            volume: row0.lots,
            alert: row0.alert,
            entry_price,
            clears_waiting_limit: false,
        });
    }

    let prev = rt.exec_map.get(&(k - 1))?;
    let row = &se.settings.rows[k as usize];
    let condition = match side {
        Side::Buy => market.ask <= prev.entry_price - row.dollar_gap,
        Side::Sell => market.bid >= prev.entry_price + row.dollar_gap,
    };
    if !condition {
        return None;
    }
    let entry_price = match side {
        Side::Buy => market.ask,
        Side::Sell => market.bid,
    };
    Some(FireCandidate {
        side,
        row_index: k,
        volume: row.lots,
        alert: row.alert,
        entry_price,
        clears_waiting_limit: false,
    })
}

fn commit_fire(se: &mut SideEngine, candidate: &FireCandidate, now: f64, equity: f64) {
    let rt = &mut se.runtime;
    if candidate.clears_waiting_limit {
        rt.waiting_limit = false;
    }
    if candidate.row_index == 0 {
        rt.start_ref = candidate.entry_price;
        if rt.equity_at_arm.is_none() {
            rt.equity_at_arm = Some(equity);
        }
    }
    rt.last_order_sent_ts = now;
    rt.last_fired_index = Some(candidate.row_index);
}

fn complete_closing(engine: &mut Engine, side: Side, now: f64) {
    let ready = {
        let rt = &engine.side(side).runtime;
        rt.is_closing && rt.exec_map.is_empty() && !rt.in_flight(now)
    };
    if !ready {
        return;
    }
    let cyclic = engine.cyclic_on;
    let se = engine.side_mut(side);
    let eligible = se.runtime.auto_restart_eligible;
    se.runtime.clear_session();
    if cyclic && eligible {
        se.runtime.on = true;
        arm_fresh_session(se, side);
        info!(%side, session_id = %se.runtime.session_id, "closing drained, cyclic re-arm");
    } else {
        se.runtime.on = false;
        info!(%side, "closing drained, side idle");
    }
    engine.record_action(now, format!("{side}: closing drained"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_state::SideLifecycle;
    use crate::settings::GridRow;
    use crate::types::TpType;

    fn row(index: u32, dollar_gap: f64, lots: f64) -> GridRow {
        GridRow { index, dollar_gap, lots, alert: false }
    }

    fn pos(kind: &str, volume: f64, price: f64, profit: f64, comment: &str) -> PositionInput {
        PositionInput {
            ticket: 1,
            kind: kind.to_string(),
            volume,
            price,
            profit,
            comment: comment.to_string(),
        }
    }

    fn tick(equity: f64, balance: f64, ask: f64, bid: f64, positions: Vec<PositionInput>) -> TickInput {
        TickInput { equity, balance, ask, bid, positions }
    }

    fn session_hash(comment: &str) -> String {
        identity::decode(comment).expect("comment should parse").hash
    }

    // S1 — market BUY, three-row grid, TP by fixed-money.
    #[test]
    fn s1_market_buy_three_row_grid_tp_fixed_money() {
        let mut engine = Engine::default();
        engine.buy.settings = UserSettings {
            limit_price: 0.0,
            tp_type: TpType::FixedMoney,
            tp_value: 5.0,
            hedge_value: 0.0,
            rows: vec![row(0, 0.0, 0.01), row(1, 10.0, 0.01), row(2, 10.0, 0.01)],
        };
        engine.set_side_on(Side::Buy, true, 0.0);
        assert_eq!(engine.buy.runtime.lifecycle(), SideLifecycle::Armed);

        // t1: row 0 fires at market.
        let t1 = engine.process_tick(&tick(1000.0, 1000.0, 100.0, 99.9, vec![]), 1.0);
        assert_eq!(t1.action, Action::Buy);
        assert_eq!(t1.volume, Some(0.01));
        let comment0 = t1.comment.clone().unwrap();
        let hash = session_hash(&comment0);
        assert_eq!(comment0, format!("buy_{hash}_idx0"));

        // t2: position visible, no gap crossed yet -> WAIT.
        let t2 = engine.process_tick(
            &tick(1000.0, 1000.0, 100.0, 99.9, vec![pos("BUY", 0.01, 100.0, 0.0, &comment0)]),
            2.0,
        );
        assert_eq!(t2.action, Action::Wait);

        // t3: price drops by the row-1 gap -> expansion fires idx1.
        let t3 = engine.process_tick(
            &tick(1000.0, 1000.0, 90.0, 89.9, vec![pos("BUY", 0.01, 100.0, 0.0, &comment0)]),
            3.0,
        );
        assert_eq!(t3.action, Action::Buy);
        let comment1 = t3.comment.unwrap();
        assert_eq!(comment1, format!("buy_{hash}_idx1"));

        // t7: combined profit crosses the $5 target -> CLOSE_ALL.
        let positions_with_profit = vec![
            pos("BUY", 0.01, 100.0, 3.0, &comment0),
            pos("BUY", 0.01, 90.0, 2.5, &comment1),
        ];
        let t7 = engine.process_tick(&tick(1000.0, 1000.0, 91.0, 90.9, positions_with_profit), 7.0);
        assert_eq!(t7.action, Action::CloseAll);
        assert_eq!(t7.comment, Some(format!("buy_{hash}")));
        assert!(engine.buy.runtime.is_closing);

        // t8: broker reports zero positions, but inside the 5s grace -> WAIT.
        let t8 = engine.process_tick(&tick(1000.0, 1000.0, 91.0, 90.9, vec![]), 8.0);
        assert_eq!(t8.action, Action::Wait);
        assert!(engine.buy.runtime.is_closing);

        // Once the grace elapses, the side drains back to Idle.
        let t_after_grace = engine.process_tick(&tick(1000.0, 1000.0, 91.0, 90.9, vec![]), 13.0);
        assert_eq!(t_after_grace.action, Action::Wait);
        assert_eq!(engine.buy.runtime.lifecycle(), SideLifecycle::Idle);
        assert!(engine.buy.runtime.exec_map.is_empty());
        assert!(engine.buy.runtime.session_id.is_empty());
    }

    // S2 — limit-armed SELL.
    #[test]
    fn s2_limit_armed_sell() {
        let mut engine = Engine::default();
        engine.sell.settings = UserSettings {
            limit_price: 1.1000,
            tp_type: TpType::FixedMoney,
            tp_value: 0.0,
            hedge_value: 0.0,
            rows: vec![row(0, 0.0, 0.1)],
        };
        engine.set_side_on(Side::Sell, true, 0.0);
        assert_eq!(engine.sell.runtime.lifecycle(), SideLifecycle::WaitingLimit);

        // Limit not yet crossed -> WAIT, still waiting.
        let t1 = engine.process_tick(&tick(1000.0, 1000.0, 1.0951, 1.0950, vec![]), 1.0);
        assert_eq!(t1.action, Action::Wait);
        assert!(engine.sell.runtime.waiting_limit);

        // Crosses the limit -> fires row 0, clears waiting_limit.
        let t2 = engine.process_tick(&tick(1000.0, 1000.0, 1.1002, 1.1001, vec![]), 2.0);
        assert_eq!(t2.action, Action::Sell);
        assert!(!engine.sell.runtime.waiting_limit);
        assert_eq!(engine.sell.runtime.start_ref, 1.1001);
    }

    // S3 — hedge trigger into an OFF opposite side.
    #[test]
    fn s3_hedge_trigger_into_off_opposite() {
        let mut engine = Engine::default();
        engine.buy.settings = UserSettings {
            limit_price: 0.0,
            tp_type: TpType::FixedMoney,
            tp_value: 0.0,
            hedge_value: 50.0,
            rows: vec![row(0, 0.0, 0.01), row(1, 10.0, 0.02)],
        };
        engine.set_side_on(Side::Buy, true, 0.0);
        let hash = engine.buy.runtime.session_hash().to_string();
        engine.buy.runtime.exec_map.insert(
            0,
            RowExecStats { index: 0, entry_price: 100.0, lots: 0.01, profit: -20.0, timestamp: 0.0 },
        );
        engine.buy.runtime.exec_map.insert(
            1,
            RowExecStats { index: 1, entry_price: 90.0, lots: 0.02, profit: -30.1, timestamp: 0.0 },
        );

        assert!(!engine.sell.runtime.on);
        let comment0 = identity::encode(Side::Buy, &hash, 0);
        let comment1 = identity::encode(Side::Buy, &hash, 1);
        let t1 = engine.process_tick(
            &tick(
                1000.0,
                1000.0,
                90.0,
                89.9,
                vec![
                    pos("BUY", 0.01, 100.0, -20.0, &comment0),
                    pos("BUY", 0.02, 90.0, -30.1, &comment1),
                ],
            ),
            1.0,
        );
        assert!(engine.buy.runtime.hedge_triggered);
        assert!(engine.sell.runtime.on);
        assert_eq!(engine.sell.settings.rows.len(), 1);
        assert_eq!(engine.sell.settings.rows[0].lots, 0.03);
        // The injection never fires in the same tick it was created.
        assert_ne!(t1.action, Action::Sell);

        // Next tick: the opposite side fires its synthetic row 0 at market.
        let t2 = engine.process_tick(&tick(1000.0, 1000.0, 90.0, 89.9, vec![]), 2.0);
        assert_eq!(t2.action, Action::Sell);
        assert_eq!(t2.volume, Some(0.03));

        // The BUY side stays locked regardless of further price movement.
        let t3 = engine.process_tick(&tick(1000.0, 1000.0, 50.0, 49.9, vec![
            pos("BUY", 0.01, 100.0, -20.0, &comment0),
            pos("BUY", 0.02, 90.0, -30.1, &comment1),
        ]), 3.0);
        assert_ne!(t3.action, Action::Buy);
    }

    // S4 — Sync-Shield suppression.
    #[test]
    fn s4_sync_shield_suppression() {
        let mut engine = Engine::default();
        engine.buy.settings = UserSettings {
            limit_price: 0.0,
            tp_type: TpType::FixedMoney,
            tp_value: 0.0,
            hedge_value: 0.0,
            rows: vec![row(0, 0.0, 0.01)],
        };
        engine.set_side_on(Side::Buy, true, 0.0);

        let t_fire = engine.process_tick(&tick(1000.0, 1000.0, 100.0, 99.9, vec![]), 10.0);
        assert_eq!(t_fire.action, Action::Buy);
        assert_eq!(engine.buy.runtime.last_order_sent_ts, 10.0);

        // t=11.0, broker hasn't reported the position yet -> suppressed, no rotation.
        let t_suppressed = engine.process_tick(&tick(1000.0, 1000.0, 100.0, 99.9, vec![]), 11.0);
        assert_eq!(t_suppressed.action, Action::Wait);
        assert!(!engine.buy.runtime.session_id.is_empty());
        assert_eq!(engine.buy.runtime.lifecycle(), SideLifecycle::Armed);

        // t=15.5, grace has elapsed -> external close path clears the session.
        let t_external = engine.process_tick(&tick(1000.0, 1000.0, 100.0, 99.9, vec![]), 15.5);
        assert_eq!(t_external.action, Action::Wait);
        assert!(engine.buy.runtime.session_id.is_empty());
        assert_eq!(engine.buy.runtime.lifecycle(), SideLifecycle::Idle);
    }

    // S5 — Identity conflict.
    #[test]
    fn s5_identity_conflict() {
        let mut engine = Engine::default();
        engine.buy.settings = UserSettings {
            limit_price: 0.0,
            tp_type: TpType::FixedMoney,
            tp_value: 0.0,
            hedge_value: 0.0,
            rows: vec![row(0, 0.0, 0.01)],
        };
        engine.buy.runtime.session_id = "buy_a1b2c3d4".to_string();

        let outcome = engine.process_tick(
            &tick(1000.0, 1000.0, 100.0, 99.9, vec![pos("BUY", 0.01, 100.0, 0.0, "buy_deadbeef_idx0")]),
            1.0,
        );

        assert_eq!(outcome.action, Action::Wait);
        assert!(!engine.error_status.is_empty());
        // No state mutation on the conflicted side.
        assert!(engine.buy.runtime.exec_map.is_empty());
        assert_eq!(engine.buy.runtime.session_id, "buy_a1b2c3d4");

        // Emergency close is the only thing that clears the latch.
        engine.emergency_close(2.0);
        assert!(engine.error_status.is_empty());
    }

    // S6 — alert acknowledgement: clearing a row's alert is always accepted
    // and changes nothing else about the session (exercised at the
    // UserSettings level — see settings.rs's differs_only_by_alert tests for
    // the acceptance-path invariant itself).
    #[test]
    fn s6_alert_flag_is_independent_of_runtime() {
        let mut engine = Engine::default();
        engine.buy.settings.rows = vec![
            row(0, 0.0, 0.01),
            GridRow { index: 1, dollar_gap: 10.0, lots: 0.01, alert: true },
        ];
        engine.set_side_on(Side::Buy, true, 0.0);
        let before = engine.buy.runtime.clone();

        engine.apply_settings(Side::Buy, UserSettings {
            rows: vec![
                row(0, 0.0, 0.01),
                GridRow { index: 1, dollar_gap: 10.0, lots: 0.01, alert: false },
            ],
            ..engine.buy.settings.clone()
        });

        assert_eq!(engine.buy.settings.rows[1].alert, false);
        assert_eq!(engine.buy.runtime.session_id, before.session_id);
        assert_eq!(engine.buy.runtime.exec_map, before.exec_map);
    }

    // I1: |exec_map| never exceeds |rows|.
    #[test]
    fn i1_exec_map_never_exceeds_rows() {
        let mut engine = Engine::default();
        engine.buy.settings = UserSettings {
            limit_price: 0.0,
            tp_type: TpType::FixedMoney,
            tp_value: 0.0,
            hedge_value: 0.0,
            rows: vec![row(0, 0.0, 0.01), row(1, 10.0, 0.01)],
        };
        engine.set_side_on(Side::Buy, true, 0.0);
        let mut now = 1.0;
        let mut positions = vec![];
        for ask in [100.0, 90.0, 80.0, 70.0, 60.0] {
            let outcome = engine.process_tick(&tick(1000.0, 1000.0, ask, ask - 0.1, positions.clone()), now);
            if let (Action::Buy, Some(comment)) = (outcome.action, outcome.comment.clone()) {
                positions.push(pos("BUY", 0.01, ask, 0.0, &comment));
            }
            assert!(engine.buy.runtime.exec_map.len() <= engine.buy.settings.rows.len());
            now += 1.0;
        }
    }

    // I3: at most one action is emitted per tick, even when both sides have
    // a pending fire — BUY wins the deterministic tie-break.
    #[test]
    fn i3_and_tie_break_buy_before_sell() {
        let mut engine = Engine::default();
        let grid = UserSettings {
            limit_price: 0.0,
            tp_type: TpType::FixedMoney,
            tp_value: 0.0,
            hedge_value: 0.0,
            rows: vec![row(0, 0.0, 0.01)],
        };
        engine.buy.settings = grid.clone();
        engine.sell.settings = grid;
        engine.set_side_on(Side::Buy, true, 0.0);
        engine.set_side_on(Side::Sell, true, 0.0);

        let outcome = engine.process_tick(&tick(1000.0, 1000.0, 100.0, 99.9, vec![]), 1.0);
        assert_eq!(outcome.action, Action::Buy);
        // SELL's own row-0 fire is still pending for the next tick.
        assert_eq!(engine.sell.runtime.next_index(), 0);
    }

    // I5: a TP close can only be emitted once hedge_triggered is false.
    #[test]
    fn i5_tp_close_blocked_while_hedge_locked() {
        let mut engine = Engine::default();
        engine.buy.settings = UserSettings {
            limit_price: 0.0,
            tp_type: TpType::FixedMoney,
            tp_value: 1.0,
            hedge_value: 0.0,
            rows: vec![row(0, 0.0, 0.01)],
        };
        engine.set_side_on(Side::Buy, true, 0.0);
        engine.buy.runtime.hedge_triggered = true;
        engine.buy.runtime.exec_map.insert(
            0,
            RowExecStats { index: 0, entry_price: 100.0, lots: 0.01, profit: 10.0, timestamp: 0.0 },
        );

        let outcome = engine.process_tick(
            &tick(1000.0, 1000.0, 100.0, 99.9, vec![pos(
                "BUY", 0.01, 100.0, 10.0,
                &identity::encode(Side::Buy, engine.buy.runtime.session_hash(), 0),
            )]),
            1.0,
        );
        assert_ne!(outcome.action, Action::CloseAll);
        assert!(!engine.buy.runtime.is_closing);
    }

    // I6: hedge trigger strictly precedes any expansion on the same tick —
    // a side whose loss crosses the threshold is locked before its own next
    // row would otherwise have fired.
    #[test]
    fn i6_hedge_precedes_expansion_same_tick() {
        let mut engine = Engine::default();
        engine.buy.settings = UserSettings {
            limit_price: 0.0,
            tp_type: TpType::FixedMoney,
            tp_value: 0.0,
            hedge_value: 10.0,
            rows: vec![row(0, 0.0, 0.01), row(1, 5.0, 0.01)],
        };
        engine.set_side_on(Side::Buy, true, 0.0);
        let hash = engine.buy.runtime.session_hash().to_string();
        engine.buy.runtime.exec_map.insert(
            0,
            RowExecStats { index: 0, entry_price: 100.0, lots: 0.01, profit: -15.0, timestamp: 0.0 },
        );

        // Price has also crossed row 1's gap (ask <= 95), which would
        // otherwise expand — but the hedge check runs first and locks it.
        let outcome = engine.process_tick(
            &tick(1000.0, 1000.0, 94.0, 93.9, vec![pos(
                "BUY", 0.01, 100.0, -15.0, &identity::encode(Side::Buy, &hash, 0),
            )]),
            1.0,
        );
        assert!(engine.buy.runtime.hedge_triggered);
        assert_ne!(outcome.action, Action::Buy);
        assert_eq!(engine.buy.runtime.next_index(), 1);
    }
}
