use std::io::Write;
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use pulselink::config::Options;
use pulselink::core::Core;
use pulselink::link::SensorLink;
use pulselink::manager::ConnectionManager;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// How long shutdown waits for the connection manager to release the link.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

fn init_logging(verbose: bool) {
    let default_directive = if verbose {
        "pulselink=debug"
    } else {
        "pulselink=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The configured sensor link, or `None` when the binary was built without a
/// Bluetooth backend.
fn sensor_link() -> Option<Arc<dyn SensorLink>> {
    #[cfg(feature = "bluer")]
    {
        Some(Arc::new(pulselink::link::bluer::BluerLink::new()))
    }
    #[cfg(not(feature = "bluer"))]
    {
        None
    }
}

/// Mirror the live feed to stdout, one JSON object per line.
async fn print_events(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
    let mut subscriber = core.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            payload = subscriber.rx.recv() => match payload {
                Some(line) => {
                    if writeln!(std::io::stdout(), "{}", line).is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }
    core.unsubscribe(subscriber.id);
}

async fn run(options: Options) -> std::io::Result<()> {
    let core = Arc::new(Core::new(
        options.metrics_config(),
        options.effective_window(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager_task = match sensor_link() {
        Some(link) => {
            let manager = Arc::new(ConnectionManager::new(
                Arc::clone(&core),
                link,
                options.manager_config(),
            ));
            let shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move { manager.run(shutdown).await }))
        }
        None => {
            tracing::error!("built without a Bluetooth backend; no sensor link available");
            None
        }
    };
    let printer = tokio::spawn(print_events(Arc::clone(&core), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received; shutting down");
    let _ = shutdown_tx.send(true);

    if let Some(task) = manager_task
        && tokio::time::timeout(SHUTDOWN_WAIT, task).await.is_err()
    {
        tracing::warn!("connection manager did not stop in time");
    }
    let _ = tokio::time::timeout(SHUTDOWN_WAIT, printer).await;

    if let Some(stats) = core.compute_default_stats() {
        tracing::info!(
            count = stats.count,
            bpm_avg = stats.bpm_avg,
            window_secs = core.default_window_secs(),
            "final window summary"
        );
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    match run(options).await {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
