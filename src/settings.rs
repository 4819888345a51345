//! Pipeline configuration.
//!
//! A plain value the driver fills in (from its own flag parsing, which
//! lives outside this library) and hands to the pipeline builders.

use std::fmt;
use std::str::FromStr;

/// How aggressive the canonical optimization pipeline is. Levels are
/// monotonic: everything `O1` runs, `O2` runs too, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum OptLevel {
    /// No optimization at all.
    O0,
    /// Per-block cleanups only.
    O1,
    #[default]
    /// The canonical function-level pipeline.
    O2,
    /// Adds repeated cleanup rounds.
    O3,
    /// Adds interprocedural analyses.
    O4,
    /// Everything, iterated once more.
    O5,
}

impl OptLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::O0 => "O0",
            Self::O1 => "O1",
            Self::O2 => "O2",
            Self::O3 => "O3",
            Self::O4 => "O4",
            Self::O5 => "O5",
        }
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "O0" | "0" => Self::O0,
            "O1" | "1" => Self::O1,
            "O2" | "2" => Self::O2,
            "O3" | "3" => Self::O3,
            "O4" | "4" => Self::O4,
            "O5" | "5" => Self::O5,
            other => return Err(format!("unknown optimization level `{other}`")),
        })
    }
}

/// What the scheduler reports about pass execution (the `-debug-pass`
/// surface). Output goes through the `log` facade at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PassDebugLevel {
    #[default]
    None,
    /// Print each pass's argument string as it is scheduled.
    Arguments,
    /// Print the manager nesting before running.
    Structure,
    /// Print each pass as it executes.
    Executions,
    /// Executions plus required/preserved/provided sets per pass.
    Details,
}

/// Settings shared by every driver built on this library.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub opt_level: OptLevel,
    pub pass_debug: PassDebugLevel,
    /// Collect and report per-pass wall time.
    pub time_passes: bool,
    /// Run the verifier after every pass.
    pub verify_each: bool,
    /// Leave the IR alone even if a pipeline asks for optimization.
    pub disable_opt: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opt_levels_are_ordered() {
        assert!(OptLevel::O0 < OptLevel::O2);
        assert!(OptLevel::O5 > OptLevel::O4);
        assert_eq!("O3".parse::<OptLevel>().unwrap(), OptLevel::O3);
        assert!("O9".parse::<OptLevel>().is_err());
    }
}
