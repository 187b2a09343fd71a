// Wait/cancellation controller
//
// Blocks a supervising caller until a unit is dormant. Every pass polls
// the control stream for Ctrl-C (when asked to), runs one scheduler tick
// so the target and its peers make progress, feeds the watchdog, drains
// a batch of interrupt events, then sleeps one quantum. It never spins
// without the quantum sleep.

use core::fmt::Write as _;

use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};

use super::Kernel;
use crate::drivers::{Console, Host};
use crate::sandbox::{State, TaskId};
use crate::vm::Vm;

/// Interrupt byte on the control stream (ASCII ETX, Ctrl-C).
pub const CTRL_C: u8 = 0x03;

/// Interrupt events handled per quantum while blocked.
pub const EVENTS_PER_QUANTUM: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    /// Ctrl-C seen; the unit was asked to unwind
    Interrupted,
    /// Limit passed; the unit is left running
    TimedOut,
}

impl WaitOutcome {
    pub const fn completed(self) -> bool {
        matches!(self, WaitOutcome::Completed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOptions {
    /// watch the control stream for Ctrl-C
    pub signal: bool,
    pub timeout_ms: Option<u32>,
}

impl WaitOptions {
    pub const fn signal() -> Self {
        Self {
            signal: true,
            timeout_ms: None,
        }
    }

    pub const fn timeout(ms: u32) -> Self {
        Self {
            signal: false,
            timeout_ms: Some(ms),
        }
    }
}

// An id the kernel does not know counts as done.
pub fn wait<V, C, D>(kernel: &mut Kernel<V>, id: TaskId, opts: WaitOptions, host: &mut Host<'_, C, D>) -> WaitOutcome
where
    V: Vm,
    C: Console,
    D: DelayNs,
{
    let quantum = kernel.config().quantum_ms;
    let mut elapsed: u32 = 0;

    loop {
        match kernel.state(id) {
            None | Some(State::Dormant) => return WaitOutcome::Completed,
            Some(_) => {}
        }

        if opts.signal {
            match host.console.read_byte() {
                Ok(CTRL_C) => {
                    let _ = host.console.write_str("^C\n");
                    kernel.interrupt(id);
                    host.disable_watchdog();
                    info!("wait on task {}: interrupted", id);
                    return WaitOutcome::Interrupted;
                }
                // anything else on the line is not ours
                Ok(_) | Err(nb::Error::WouldBlock) => {}
                Err(nb::Error::Other(e)) => debug!("console read: {:?}", e),
            }
        }

        kernel.tick(&mut *host.console);
        host.feed_watchdog();
        host.pump_events(EVENTS_PER_QUANTUM);
        host.delay.delay_ms(quantum);

        if let Some(limit) = opts.timeout_ms {
            elapsed = elapsed.saturating_add(quantum);
            if elapsed > limit {
                warn!("wait on task {}: timed out after {} ms", id, elapsed);
                return WaitOutcome::TimedOut;
            }
        }
    }
}
