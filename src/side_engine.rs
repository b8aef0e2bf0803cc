// =============================================================================
// SideEngine — one side's settings paired with its runtime state
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::runtime_state::RuntimeState;
use crate::settings::UserSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SideEngine {
    pub settings: UserSettings,
    pub runtime: RuntimeState,
}
