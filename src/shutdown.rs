use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Expose SIGTERM/SIGINT as a `CancellationToken`.
///
/// The first signal cancels the token; the pool watches it to stop claiming
/// new jobs and begin its drain. Further signals are ignored, since the
/// drain already has its own bound.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let notifier = token.clone();

    tokio::spawn(async move {
        let Some(received) = wait_for_signal().await else {
            return;
        };
        tracing::info!(signal = received, "shutdown requested, draining");
        notifier.cancel();
    });

    token
}

/// Block until SIGTERM or SIGINT arrives, reporting which one. `None` when
/// the handlers could not be registered.
async fn wait_for_signal() -> Option<&'static str> {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(error = %err, "failed to install SIGTERM handler");
            return None;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(error = %err, "failed to install SIGINT handler");
            return None;
        }
    };

    Some(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}
