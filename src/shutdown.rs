use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancelled on the first SIGTERM or SIGINT.
///
/// Hosted jobs should be stopped once it fires so their presence is withdrawn
/// from the registry before the process exits.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if let Some(name) = termination_signal().await {
            tracing::info!(signal = name, "Stopping jobs");
            cancel.cancel();
        }
    });
    token
}

/// Resolves with the name of the first termination signal received, or
/// `None` if the handlers could not be installed.
async fn termination_signal() -> Option<&'static str> {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "Failed to install signal handlers");
            return None;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => Some("SIGTERM"),
        _ = sigint.recv() => Some("SIGINT"),
    }
}
