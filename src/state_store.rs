// =============================================================================
// Persistence (C2/C10) — atomic load/save of the full engine state
// =============================================================================
//
// Mirrors the teacher's `RuntimeConfig::load`/`save`: write to a `.tmp`
// sibling then rename over the real path, so a crash mid-write never leaves
// a half-written `state.json` behind.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::engine::Engine;

/// Load persisted engine state from `path`. Missing or corrupt files are not
/// fatal — the caller is expected to fall back to `Engine::default()` and
/// log a warning, same as the teacher's config loader.
pub fn load(path: impl AsRef<Path>) -> Result<Engine> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read engine state from {}", path.display()))?;
    let engine: Engine = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse engine state from {}", path.display()))?;
    info!(path = %path.display(), "engine state loaded");
    Ok(engine)
}

/// Load from `path`, falling back to a fresh default engine if the file is
/// missing or unreadable. A missing file (first run) is silent; a file that
/// exists but fails to parse is "corrupt" and latches a one-line warning into
/// `error_status`, per §4.2/§7.
pub fn load_or_default(path: impl AsRef<Path>) -> Engine {
    let path = path.as_ref();
    if !path.exists() {
        info!(path = %path.display(), "no prior state file, starting fresh");
        return Engine::default();
    }
    match load(path) {
        Ok(engine) => engine,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "state file is corrupt, starting from a fresh engine state");
            let mut engine = Engine::default();
            engine.error_status = format!("corrupt state file at startup: {e}");
            engine
        }
    }
}

/// Persist `engine` to `path` using an atomic write (tmp file + rename).
pub fn save(engine: &Engine, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let content = serde_json::to_string_pretty(engine).context("failed to serialise engine state")?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp state to {}", path.display()))?;

    Ok(())
}
