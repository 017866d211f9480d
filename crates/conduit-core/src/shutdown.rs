//! Process shutdown signals.

use tracing::info;

/// Which signal asked the process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Waits for Ctrl+C and, on unix, SIGTERM.
pub struct ShutdownListener {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl ShutdownListener {
    /// Install the handlers. Do this before serving so an early SIGTERM is
    /// caught instead of killing the process.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            sigterm: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    pub async fn recv(&mut self) -> std::io::Result<ShutdownSignal> {
        #[cfg(unix)]
        let sigterm_future = self.sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C shutdown signal");
                Ok(ShutdownSignal::Interrupt)
            }
            _ = sigterm_future => {
                info!("Received SIGTERM shutdown signal");
                Ok(ShutdownSignal::Terminate)
            }
        }
    }
}
