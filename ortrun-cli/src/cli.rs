use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use ortrun::Mode;

/// Poll the job service and run the analysis toolchain on each job
#[derive(Parser)]
#[command(name = "ortrun", version)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "ORTRUN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Pipeline to run, overriding the configuration and MODE
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Process at most one job, then exit
    #[arg(long)]
    pub once: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Scan,
    Analyze,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Scan => Mode::Scan,
            ModeArg::Analyze => Mode::Analyze,
        }
    }
}
