// =============================================================================
// EngineError — the closed set of rejections the engine can hand back
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("unknown side \"{0}\", expected \"buy\" or \"sell\"")]
    UnknownSide(String),
}
