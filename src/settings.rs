// =============================================================================
// UserSettings — per-side configuration, validated on every update
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::TpType;

/// One planned grid entry. Row 0 is the anchor entry and its `dollar_gap` is
/// never read (only `lots` matters for row 0, per §3 invariant 6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRow {
    pub index: u32,
    pub dollar_gap: f64,
    pub lots: f64,
    pub alert: bool,
}

/// Per-side user-configurable settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    /// 0 => enter at market on arm; >0 => wait until price crosses it
    /// favorably (BUY: ask <= limit; SELL: bid >= limit).
    pub limit_price: f64,
    pub tp_type: TpType,
    /// 0 => TP disabled regardless of `tp_type`.
    pub tp_value: f64,
    /// 0 => hedge disabled.
    pub hedge_value: f64,
    pub rows: Vec<GridRow>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            limit_price: 0.0,
            tp_type: TpType::FixedMoney,
            tp_value: 0.0,
            hedge_value: 0.0,
            rows: Vec::new(),
        }
    }
}

impl UserSettings {
    /// Validate a settings payload in isolation (no knowledge of the
    /// currently-running session). Returns the first violation found.
    ///
    /// `min_rows` is the number of rows the current session has already
    /// consumed (`|exec_map|`) — shrinking `rows` below that would orphan
    /// live positions, so it is rejected (§6).
    pub fn validate(&self, min_rows: usize) -> Result<(), EngineError> {
        if self.limit_price < 0.0 {
            return Err(EngineError::InvalidSettings("limit_price must be >= 0".to_string()));
        }
        if self.tp_value < 0.0 {
            return Err(EngineError::InvalidSettings("tp_value must be >= 0".to_string()));
        }
        if self.hedge_value < 0.0 {
            return Err(EngineError::InvalidSettings("hedge_value must be >= 0".to_string()));
        }
        if self.rows.len() < min_rows {
            return Err(EngineError::InvalidSettings(format!(
                "rows shrunk to {} but {} rows are already executing",
                self.rows.len(),
                min_rows
            )));
        }
        for (position, row) in self.rows.iter().enumerate() {
            if row.index as usize != position {
                return Err(EngineError::InvalidSettings(format!(
                    "row at position {position} must carry index {position}, found {}",
                    row.index
                )));
            }
            if position > 0 && row.dollar_gap < 0.0 {
                return Err(EngineError::InvalidSettings(format!("row {position}: dollar_gap must be >= 0")));
            }
            if row.lots < 0.0 {
                return Err(EngineError::InvalidSettings(format!("row {position}: lots must be >= 0")));
            }
        }
        Ok(())
    }

    /// Settings differ only in `rows[*].alert` flags — the one mutation §6
    /// always allows regardless of the rest of the acceptance rules.
    pub fn differs_only_by_alert(&self, other: &UserSettings) -> bool {
        if self.limit_price != other.limit_price
            || self.tp_type != other.tp_type
            || self.tp_value != other.tp_value
            || self.hedge_value != other.hedge_value
            || self.rows.len() != other.rows.len()
        {
            return false;
        }
        self.rows.iter().zip(other.rows.iter()).all(|(a, b)| {
            a.index == b.index && a.dollar_gap == b.dollar_gap && a.lots == b.lots
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_row_settings() -> UserSettings {
        UserSettings {
            limit_price: 0.0,
            tp_type: TpType::FixedMoney,
            tp_value: 5.0,
            hedge_value: 0.0,
            rows: vec![
                GridRow { index: 0, dollar_gap: 0.0, lots: 0.01, alert: false },
                GridRow { index: 1, dollar_gap: 10.0, lots: 0.01, alert: false },
                GridRow { index: 2, dollar_gap: 10.0, lots: 0.01, alert: false },
            ],
        }
    }

    #[test]
    fn valid_settings_pass() {
        assert!(three_row_settings().validate(0).is_ok());
    }

    #[test]
    fn rejects_negative_tp_value() {
        let mut s = three_row_settings();
        s.tp_value = -1.0;
        assert!(s.validate(0).is_err());
    }

    #[test]
    fn rejects_shrinking_rows_below_exec_map() {
        let mut s = three_row_settings();
        s.rows.truncate(1);
        assert!(s.validate(2).is_err());
        assert!(s.validate(1).is_ok());
    }

    #[test]
    fn alert_only_change_is_detected() {
        let a = three_row_settings();
        let mut b = a.clone();
        b.rows[1].alert = true;
        assert!(a.differs_only_by_alert(&b));
        b.rows[1].lots = 0.02;
        assert!(!a.differs_only_by_alert(&b));
    }
}
