//! The canonical optimization pipelines.
//!
//! Levels are monotonic: each adds to the one below. Every pipeline ends
//! with the verifier, which is also what the drivers run after parsing.

use crate::error::Result;
use crate::pass::PassManager;
use crate::settings::{OptLevel, Settings};

/// Populate `pm` with the canonical pipeline for `settings`.
pub fn add_canonical_passes(pm: &mut PassManager, settings: &Settings) -> Result<()> {
    if settings.disable_opt || settings.opt_level == OptLevel::O0 {
        pm.add_by_argument("verify")?;
        return Ok(());
    }
    // O1: cheap per-block cleanup.
    pm.add_by_argument("die")?;
    if settings.opt_level >= OptLevel::O2 {
        pm.add_by_argument("mem2reg")?;
        pm.add_by_argument("constprop")?;
        pm.add_by_argument("dce")?;
    }
    if settings.opt_level >= OptLevel::O3 {
        // A second round picks up what promotion exposed.
        pm.add_by_argument("constprop")?;
        pm.add_by_argument("dce")?;
    }
    if settings.opt_level >= OptLevel::O4 {
        // Interprocedural shape information; clients (pool allocation,
        // alias queries) read the cached graphs.
        pm.add_by_argument("dsa-local")?;
        pm.add_by_argument("dsa-bu")?;
    }
    if settings.opt_level >= OptLevel::O5 {
        pm.add_by_argument("dsa-td")?;
    }
    pm.add_by_argument("verify")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::pass::PassRegistry;

    #[test]
    fn pipelines_grow_monotonically() {
        let registry = Rc::new(PassRegistry::with_builtin_passes());
        let mut sizes = Vec::new();
        for level in [
            OptLevel::O0,
            OptLevel::O1,
            OptLevel::O2,
            OptLevel::O3,
            OptLevel::O4,
            OptLevel::O5,
        ] {
            let settings = Settings {
                opt_level: level,
                ..Settings::default()
            };
            let mut pm = PassManager::new(registry.clone(), settings.clone());
            add_canonical_passes(&mut pm, &settings).unwrap();
            sizes.push(pm.dump_structure().lines().count());
        }
        for pair in sizes.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }
}
