use clap::Parser;

/// Stat projections runtime CLI arguments
#[derive(Debug, Parser)]
#[command(
    name = "stat-projections-runtime",
    version,
    about = "Background jobs, query cache and live updates for stat projections"
)]
pub struct Cli {
    /// Address for the admin HTTP and WebSocket server
    #[arg(long)]
    pub bind: Option<String>,

    /// Minimum severity that is dispatched as an alert
    #[arg(long)]
    pub alert_level: Option<String>,

    /// Start without the background job scheduler
    #[arg(long)]
    pub no_scheduler: bool,
}
