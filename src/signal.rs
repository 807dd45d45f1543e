use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::error::Result;

/// Installs the process-wide SIGINT/SIGTERM handler. The returned flag reads
/// `true` until the first signal arrives. Can only be called once per process.
pub fn install_running_flag() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        if flag.swap(false, Ordering::AcqRel) {
            info!("stop requested");
        }
    })?;
    Ok(running)
}
