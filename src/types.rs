// =============================================================================
// Shared types used across the grid/hedge decision engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// One side of the dual-sided grid. Each side owns independent settings,
/// rows, session, and runtime flags; the pair share only the symbol and the
/// emergency control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// The opposite side — used by the hedge controller to find its target.
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The single action command the engine emits in response to a heartbeat.
/// A closed enumeration, not open polymorphism — exactly one branch is
/// emitted per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "WAIT")]
    Wait,
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "CLOSE_ALL")]
    CloseAll,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Wait => "WAIT",
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::CloseAll => "CLOSE_ALL",
        };
        write!(f, "{s}")
    }
}

/// Take-profit basis. `tp_value == 0` disables TP regardless of type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpType {
    EquityPct,
    BalancePct,
    FixedMoney,
}

impl std::fmt::Display for TpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TpType::EquityPct => "equity_pct",
            TpType::BalancePct => "balance_pct",
            TpType::FixedMoney => "fixed_money",
        };
        write!(f, "{s}")
    }
}

/// Last-seen market snapshot, shared by both sides.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub ask: f64,
    pub bid: f64,
    pub equity: f64,
    pub balance: f64,
}
