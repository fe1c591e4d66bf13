//! Terminal dashboard: follows one company/survey and prints its aggregates
//! every time they change.

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use survey_pulse::dashboard::{DashboardClient, DashboardOptions, DashboardScope};

#[derive(Debug, Parser)]
#[command(name = "dashboard", version, about = "Live survey aggregates in the terminal")]
struct Args {
    /// Server base URL
    #[arg(long, env = "DASHBOARD_SERVER", default_value = "http://localhost:3000")]
    server: String,

    #[arg(long, env = "DASHBOARD_COMPANY_ID")]
    company_id: String,

    #[arg(long, env = "DASHBOARD_SURVEY_ID")]
    survey_id: String,

    /// Quiet period before refetching after a change event
    #[arg(long, default_value_t = 800)]
    debounce_ms: u64,

    /// Delay before reconnecting a dropped event stream
    #[arg(long, default_value_t = 2000)]
    reconnect_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // stdout carries the aggregates; logs go to stderr
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut client = DashboardClient::new(DashboardOptions {
        server: args.server,
        scope: DashboardScope {
            company_id: args.company_id,
            survey_id: args.survey_id,
        },
        debounce: Duration::from_millis(args.debounce_ms),
        reconnect_delay: Duration::from_millis(args.reconnect_ms),
    })?;

    tokio::select! {
        _ = client.run() => {},
        _ = tokio::signal::ctrl_c() => {},
    }
    Ok(())
}
