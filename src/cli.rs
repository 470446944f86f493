use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "rideau-sensor-sim",
    version,
    about = "Simulated Rideau Canal sensor fleet"
)]
pub struct Args {
    /// JSON fleet description; the built-in Rideau Canal sensors are used when omitted.
    #[arg(long)]
    pub fleet_file: Option<PathBuf>,
    /// Seconds between readings for sensors that do not set their own interval.
    #[arg(long)]
    pub interval: Option<u64>,
    /// Log readings locally instead of publishing them.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
    /// Run only the named sensor (repeatable).
    #[arg(long = "sensor")]
    pub sensors: Vec<String>,
}
