use serde::{Deserialize, Serialize};
use std::fmt;

/// Strongly-typed solver catalogue
/// Each solver only differs in how the benchmark is handed to it, so the
/// command line is built from data rather than per-solver code paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Solver {
    Z3,
    Cvc5,
    Bitwuzla,
    Jfs,
    Coral,
    Colibri,
    Xsat,
    Gosat,
    Optsat,
    Ol1v3r,
    OptsatBitwuzla,
}

/// How the benchmark path is appended to the tool's arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BenchmarkArg {
    /// `<benchmark>`
    Positional,
    /// `-- <benchmark>`, stops option parsing for oddly named files
    AfterSeparator,
    /// `-f <benchmark>`
    FileFlag,
}

impl Solver {
    /// Returns all solver variants
    /// This is the single source of truth for available solvers
    pub fn all_variants() -> &'static [Solver] {
        &[
            Solver::Z3,
            Solver::Cvc5,
            Solver::Bitwuzla,
            Solver::Jfs,
            Solver::Coral,
            Solver::Colibri,
            Solver::Xsat,
            Solver::Gosat,
            Solver::Optsat,
            Solver::Ol1v3r,
            Solver::OptsatBitwuzla,
        ]
    }

    /// Parse a solver from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Solver> {
        let wanted = s.to_lowercase();
        Self::all_variants()
            .iter()
            .copied()
            .find(|solver| solver.to_string() == wanted)
    }

    fn benchmark_arg(&self) -> BenchmarkArg {
        match self {
            Solver::Z3 => BenchmarkArg::AfterSeparator,
            Solver::Gosat | Solver::Optsat => BenchmarkArg::FileFlag,
            _ => BenchmarkArg::Positional,
        }
    }

    /// Build the full command line for one invocation
    ///
    /// `benchmark` must already be the path as seen from inside the
    /// execution substrate.
    pub fn command_line(&self, tool_path: &str, additional_args: &[String], benchmark: &str) -> Vec<String> {
        let mut cmd = Vec::with_capacity(additional_args.len() + 3);
        cmd.push(tool_path.to_string());
        cmd.extend(additional_args.iter().cloned());
        match self.benchmark_arg() {
            BenchmarkArg::Positional => {}
            BenchmarkArg::AfterSeparator => cmd.push("--".to_string()),
            BenchmarkArg::FileFlag => cmd.push("-f".to_string()),
        }
        cmd.push(benchmark.to_string());
        cmd
    }
}

impl fmt::Display for Solver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Solver::Z3 => "z3",
            Solver::Cvc5 => "cvc5",
            Solver::Bitwuzla => "bitwuzla",
            Solver::Jfs => "jfs",
            Solver::Coral => "coral",
            Solver::Colibri => "colibri",
            Solver::Xsat => "xsat",
            Solver::Gosat => "gosat",
            Solver::Optsat => "optsat",
            Solver::Ol1v3r => "ol1v3r",
            Solver::OptsatBitwuzla => "optsat-bitwuzla",
        };
        write!(f, "{}", name)
    }
}
