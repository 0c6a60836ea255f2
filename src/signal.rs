use tokio::signal::unix::{signal, Signal, SignalKind};

/// What the process should do in response to an OS signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTo {
    /// Re-read the config file (SIGHUP).
    ReloadFromDisk,
    /// Stop scraping and wait for workers to drain (SIGINT, SIGTERM).
    Shutdown,
    /// Exit without draining (SIGQUIT).
    Quit,
}

/// The Unix signals the agent reacts to.
pub struct Signals {
    hangup: Signal,
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

impl Signals {
    /// Installs the signal handlers. Fails if the runtime cannot register
    /// them, which the caller should treat as a startup error.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    /// Waits for the next signal of interest and maps it to the action it
    /// requests.
    pub async fn recv(&mut self) -> SignalTo {
        tokio::select! {
            _ = self.hangup.recv() => {
                info!(message = "received SIGHUP, scheduling config reload");
                SignalTo::ReloadFromDisk
            }
            _ = self.interrupt.recv() => {
                info!(message = "received SIGINT, shutting down");
                SignalTo::Shutdown
            }
            _ = self.terminate.recv() => {
                info!(message = "received SIGTERM, shutting down");
                SignalTo::Shutdown
            }
            _ = self.quit.recv() => {
                info!(message = "received SIGQUIT, exiting immediately");
                SignalTo::Quit
            }
        }
    }
}
