//! Ctrl+C handling.
//!
//! The first SIGINT sets a flag that async code polls so the backend can be
//! shut down cleanly; a second one exits immediately with status 130.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Exit status used after an interrupt.
pub const INTERRUPTED_EXIT_CODE: u8 = 130;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Global interrupt flag, registered once with SIGINT.
static INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Register the SIGINT handler. Safe to call multiple times (only the first
/// call registers; subsequent calls are no-ops).
pub fn register_signal_handler() -> Result<()> {
    if INTERRUPT_FLAG.get().is_some() {
        return Ok(());
    }
    let flag = INTERRUPT_FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)));

    // Second Ctrl+C: the flag is already set, exit now.
    let flag_clone = Arc::clone(flag);
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGINT, move || {
            if flag_clone.load(Ordering::SeqCst) {
                std::process::exit(INTERRUPTED_EXIT_CODE as i32);
            }
        })?;
    }

    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(flag))?;

    Ok(())
}

/// Check whether the interrupt flag is set.
pub fn is_interrupted() -> bool {
    INTERRUPT_FLAG
        .get()
        .map(|f| f.load(Ordering::SeqCst))
        .unwrap_or(false)
}

/// Clear the interrupt flag.
pub fn clear_interrupt() {
    if let Some(flag) = INTERRUPT_FLAG.get() {
        flag.store(false, Ordering::SeqCst);
    }
}

/// Resolve once the interrupt flag is set.
pub async fn poll_interrupt() {
    loop {
        if is_interrupted() {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
