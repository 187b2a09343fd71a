// Host collaborators the engine consumes, board-independent.
//
// The firmware binds these to real peripherals (UART, TIMG watchdog,
// flash-backed volume); host tests bind them to doubles.

pub mod console;
pub mod volume;
pub mod watchdog;

pub use console::Console;
pub use volume::{MemVolume, StorageError, Volume};
pub use watchdog::{Watchdog, WatchdogError};

use embedded_hal::delay::DelayNs;
use log::{info, warn};

use crate::irq::EventQueue;

/// What a blocking caller needs from the host: the control stream, a way
/// to sleep one quantum, and optionally a watchdog to keep fed and an
/// interrupt queue to keep drained.
pub struct Host<'a, C, D> {
    pub console: &'a mut C,
    pub delay: &'a mut D,
    pub watchdog: Option<&'a mut dyn Watchdog>,
    pub events: Option<&'a mut dyn EventQueue>,
}

impl<'a, C: Console, D: DelayNs> Host<'a, C, D> {
    pub fn new(console: &'a mut C, delay: &'a mut D) -> Self {
        Self {
            console,
            delay,
            watchdog: None,
            events: None,
        }
    }

    pub fn with_watchdog(mut self, watchdog: &'a mut dyn Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn with_events(mut self, events: &'a mut dyn EventQueue) -> Self {
        self.events = Some(events);
        self
    }
}

impl<C, D> Host<'_, C, D> {
    pub fn feed_watchdog(&mut self) {
        if let Some(wdt) = self.watchdog.as_deref_mut() {
            wdt.feed();
        }
    }

    // handlers run, 0 without a queue
    pub fn pump_events(&mut self, max: usize) -> usize {
        match self.events.as_deref_mut() {
            Some(queue) => queue.process(max),
            None => 0,
        }
    }

    // best effort: no watchdog is not an error
    pub fn disable_watchdog(&mut self) -> bool {
        let Some(wdt) = self.watchdog.as_deref_mut() else {
            info!("no watchdog to disable");
            return false;
        };
        match wdt.disable() {
            Ok(()) => {
                info!("watchdog disabled");
                true
            }
            Err(e) => {
                warn!("watchdog disable failed: {}", e);
                false
            }
        }
    }
}
