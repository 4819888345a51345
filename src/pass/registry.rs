//! Pass registration.
//!
//! Every pass type registers a [`PassInfo`] carrying its human name, the
//! argument string a command-line surface discovers it by, its category
//! and a constructor thunk. A driver creates one registry at startup
//! (alongside the `Context`) and hands it to its pass managers, which
//! use it to synthesize required analyses.

use std::collections::HashMap;

use crate::pass::{AnalysisId, AnyPass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Analysis,
    Optimization,
    Lowering,
    Utility,
}

pub struct PassInfo {
    /// Human-readable name, e.g. "Dominator Set Construction".
    pub name: &'static str,
    /// Command-line argument string, e.g. "domset". Doubles as the
    /// [`AnalysisId`] for analysis passes.
    pub argument: &'static str,
    pub kind: PassKind,
    /// The analysis only looks at the block graph, never at individual
    /// instructions; preserved by `Preserved::AllCfgOnly`.
    pub cfg_only: bool,
    pub ctor: fn() -> AnyPass,
}

#[derive(Default)]
pub struct PassRegistry {
    by_argument: HashMap<&'static str, PassInfo>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with every pass this crate ships.
    pub fn with_builtin_passes() -> Self {
        let mut registry = Self::new();
        crate::analysis::dominance::register(&mut registry);
        crate::analysis::callgraph::register(&mut registry);
        crate::analysis::dsa::local::register(&mut registry);
        crate::analysis::dsa::closure::register(&mut registry);
        crate::transforms::register(&mut registry);
        registry
    }

    pub fn register(&mut self, info: PassInfo) {
        debug_assert!(
            !self.by_argument.contains_key(info.argument),
            "duplicate pass argument string"
        );
        self.by_argument.insert(info.argument, info);
    }

    pub fn find(&self, argument: &str) -> Option<&PassInfo> {
        self.by_argument.get(argument)
    }

    /// Instantiate a pass by argument string.
    pub fn create(&self, argument: &str) -> Option<AnyPass> {
        self.find(argument).map(|info| (info.ctor)())
    }

    pub fn is_cfg_only(&self, id: AnalysisId) -> bool {
        self.find(id).is_some_and(|info| info.cfg_only)
    }

    pub fn is_analysis(&self, id: AnalysisId) -> bool {
        self.find(id)
            .is_some_and(|info| info.kind == PassKind::Analysis)
    }

    /// All registered argument strings, for `--help`-style listings.
    pub fn arguments(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_argument.keys().copied()
    }
}
