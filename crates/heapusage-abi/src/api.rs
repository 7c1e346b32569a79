//! In-process entry points exported to the target program.

use crate::engine;

/// Produce an on-demand report, identical to the teardown summary.
///
/// Callable from the target program (declare `void hu_report(void);`) or
/// wired to a signal via `HU_SIGNO`. Recording is disabled and the bypass
/// flag set around the dump so the reporter's own allocations are not
/// counted.
#[unsafe(no_mangle)]
pub extern "C" fn hu_report() {
    if let Some(engine) = engine::get() {
        engine.on_demand_report();
    }
}
