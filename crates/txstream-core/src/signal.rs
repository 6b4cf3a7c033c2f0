//! Signal handling for graceful shutdown.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Wait for a shutdown signal (SIGINT or SIGTERM on Unix).
///
/// # Errors
///
/// Fails if the signal handlers cannot be installed.
#[cfg(unix)]
pub async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
    }
    Ok(())
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(message = "Signal received.", signal = "ctrl-c");
    Ok(())
}

/// One-shot cancellation latch driven by termination signals.
///
/// The token is cancelled exactly once: by the first signal, by an explicit
/// [`cancel`](Self::cancel), or never if the listener is released first.
pub struct ShutdownController {
    token: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

impl ShutdownController {
    /// Create a controller and start listening for termination signals.
    ///
    /// Must be called from within a tokio runtime.
    pub fn install() -> Self {
        let mut controller = Self::detached();
        let token = controller.token.clone();
        controller.listener = Some(tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(()) => token.cancel(),
                Err(e) => error!(error = %e, "Failed to install signal handlers"),
            }
        }));
        controller
    }

    /// Create a controller with no signal listener.
    pub fn detached() -> Self {
        Self {
            token: CancellationToken::new(),
            listener: None,
        }
    }

    /// A handle to the shared cancellation context.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Detach the signal listener. The token keeps its current state.
    pub fn release(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for ShutdownController {
    fn drop(&mut self) {
        self.release();
    }
}
