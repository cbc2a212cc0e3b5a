use anyhow::{Context, Result};
use tracerun::config::LoggingSettings;
use tracerun::Application;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = Application::from_env().context("failed to load configuration")?;
    init_tracing(&app.settings().logging);

    let running = app.start().await.context("failed to start proxy")?;
    eprintln!("tracerun: proxy ready on {}", running.proxy_url());
    eprintln!("tracerun: dashboard {}", running.dashboard_url());

    // Launchers source these into the child's environment
    for (key, value) in running.child_env() {
        println!("export {key}={value}");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested");
    eprintln!("tracerun: shutting down");

    let stats = running.shutdown().await;
    eprintln!(
        "tracerun: delivered {} records ({} dropped, {} discarded at shutdown)",
        stats.delivered, stats.dropped, stats.discarded_at_shutdown
    );

    Ok(())
}
