use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Ctrl-C / SIGTERM as a cooperative stop request.
///
/// The first signal raises the flag: manual navigation treats it as "done", automatic
/// navigation and the download loop stop at the next step. A second signal exits.
pub struct StopSignal {
    should_stop: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn install(&self) -> Result<()> {
        use signal_hook::consts::{SIGINT, SIGTERM};

        for sig in [SIGINT, SIGTERM] {
            signal_hook::flag::register_conditional_shutdown(sig, 130, self.should_stop.clone())?;
        }

        #[cfg(unix)]
        {
            use signal_hook::iterator::Signals;

            let should_stop = self.should_stop.clone();
            let mut signals = Signals::new([SIGINT, SIGTERM])?;

            std::thread::spawn(move || {
                for sig in signals.forever() {
                    info!("Received stop signal ({}), finishing up. Press Ctrl-C again to exit", sig);
                    should_stop.store(true, Ordering::SeqCst);
                }
            });
        }

        #[cfg(not(unix))]
        {
            signal_hook::flag::register(SIGINT, self.should_stop.clone())?;
        }

        Ok(())
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        self.should_stop.clone()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
