//! User-facing callbacks
//!
//! The engine only reports: progress during slow derivations, the fatal
//! storage failure screen, and a passphrase prompt.

use tracing::{debug, error, info};
use zeroize::Zeroizing;

/// Progress label shown while the U2F root is recomputed
pub const PROGRESS_UPDATING: &str = "Updating";

/// Progress label shown while the seed is derived
pub const PROGRESS_WAKING_UP: &str = "Waking up";

pub trait StorageUi {
    /// Report progress in permille
    fn progress(&mut self, label: &str, permille: u32);

    /// Storage integrity is lost; the device must halt
    fn storage_failure(&mut self);

    /// Ask the user for the session passphrase, `None` if declined
    fn request_passphrase(&mut self) -> Option<Zeroizing<String>>;
}

/// Headless UI that logs through `tracing` and never supplies a passphrase
#[derive(Debug, Default)]
pub struct TracingUi;

impl StorageUi for TracingUi {
    fn progress(&mut self, label: &str, permille: u32) {
        if permille == 0 || permille >= 1000 {
            info!(label, permille, "progress");
        } else {
            debug!(label, permille, "progress");
        }
    }

    fn storage_failure(&mut self) {
        error!("storage failure detected, halting");
    }

    fn request_passphrase(&mut self) -> Option<Zeroizing<String>> {
        debug!("passphrase requested but no prompt is available");
        None
    }
}

/// Convert an `(iteration, total)` pair to permille
pub(crate) fn permille(iteration: u32, total: u32) -> u32 {
    if total == 0 {
        return 1000;
    }
    (1000 * u64::from(iteration) / u64::from(total)) as u32
}
