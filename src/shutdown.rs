use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Exit status used when a second signal cuts the drain short.
const FORCED_EXIT_CODE: i32 = 130;

/// SIGTERM and SIGINT, registered together.
struct ShutdownSignals {
    sigterm: Signal,
    sigint: Signal,
}

impl ShutdownSignals {
    fn register() -> Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for either signal and name it.
    async fn next(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

/// Install the process shutdown handler.
///
/// The first SIGTERM or SIGINT cancels the returned token: the HTTP server
/// and queue consumer stop and in-flight tasks are drained. Builds can run
/// for a long time, so a second signal exits immediately; child processes
/// are not waited for.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let signals = ShutdownSignals::register()?;
    tokio::spawn(watch(signals, token.clone()));
    Ok(token)
}

async fn watch(mut signals: ShutdownSignals, token: CancellationToken) {
    let first = signals.next().await;
    tracing::info!(signal = first, "Shutdown requested, draining in-flight tasks");
    token.cancel();

    let second = signals.next().await;
    tracing::warn!(signal = second, "Second signal received, exiting without waiting for tasks");
    std::process::exit(FORCED_EXIT_CODE);
}
