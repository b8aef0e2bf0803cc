// =============================================================================
// Hedge Controller (C5) — counter-side injection on hedge trigger
// =============================================================================
//
// Invoked by the decision engine with the losing side's total volume. Two
// cases, matching §4.5 exactly:
//
//   Case A — opposite side is off (or has no session): force it on with a
//            single synthetic row-0 of size V, to be fired at market.
//   Case B — opposite side is already accumulating: append a new row whose
//            `dollar_gap` is set so the condition is already met, so it
//            fires as soon as the injection becomes visible.
//
// The plan returned here is *applied* by the caller only after this tick's
// expansion/waiting-limit checks have already run, so the injected row can
// never fire in the same tick it was created (§8 S3: "next tick emits...").
// =============================================================================

use crate::settings::GridRow;
use crate::side_engine::SideEngine;
use crate::types::{MarketSnapshot, Side};

#[derive(Debug, Clone)]
pub enum HedgePlan {
    /// Case A: opposite side was off — replace its rows with a single
    /// market row-0 of size `volume`.
    ResetAndArm { volume: f64 },
    /// Case B: opposite side is active — append a row sized to fire
    /// immediately.
    AppendRow { row: GridRow },
}

/// Decide what the hedge controller should do to `opposite`, without
/// mutating anything yet.
pub fn plan(opposite: &SideEngine, opposite_side: Side, volume: f64, market: MarketSnapshot) -> HedgePlan {
    let active = opposite.runtime.on && !opposite.runtime.session_id.is_empty();

    if !active {
        return HedgePlan::ResetAndArm { volume };
    }

    if let Some(last) = opposite.runtime.exec_map.values().max_by_key(|s| s.index) {
        let p_now = match opposite_side {
            Side::Buy => market.ask,
            Side::Sell => market.bid,
        };
        let gap = (last.entry_price - p_now).abs();
        let row = GridRow {
            index: opposite.settings.rows.len() as u32,
            dollar_gap: gap,
            lots: volume,
            alert: true,
        };
        return HedgePlan::AppendRow { row };
    }

    // Active but exec_map empty (e.g. still WaitingLimit) — treat as Case A,
    // there is nothing to anchor a gap to yet.
    HedgePlan::ResetAndArm { volume }
}

/// Apply a previously computed hedge plan to the opposite side. `new_session`
/// generates a fresh 8-hex session hash for Case A.
pub fn apply(opposite: &mut SideEngine, opposite_side: Side, plan: HedgePlan, new_session: impl FnOnce() -> String) {
    match plan {
        HedgePlan::ResetAndArm { volume } => {
            opposite.runtime.on = true;
            opposite.runtime.session_id = format!("{opposite_side}_{}", new_session());
            opposite.runtime.waiting_limit = false;
            opposite.runtime.is_closing = false;
            opposite.runtime.hedge_triggered = false;
            opposite.runtime.exec_map.clear();
            opposite.runtime.start_ref = 0.0;
            opposite.runtime.equity_at_arm = None;
            opposite.runtime.last_order_sent_ts = 0.0;
            opposite.runtime.last_fired_index = None;
            opposite.runtime.auto_restart_eligible = true;
            opposite.settings.rows = vec![GridRow {
                index: 0,
                dollar_gap: 0.0,
                lots: volume,
                alert: true,
            }];
        }
        HedgePlan::AppendRow { row } => {
            opposite.settings.rows.push(row);
        }
    }
}
