// Host doubles shared by the unit tests.

use alloc::collections::VecDeque;
use alloc::string::String;
use core::convert::Infallible;
use core::fmt;

use embedded_hal::delay::DelayNs;

use crate::drivers::{Console, Watchdog, WatchdogError};

/// Control stream that hands out queued bytes once enough reads have
/// happened, and keeps everything written to it.
#[derive(Debug, Default)]
pub struct ScriptedConsole {
    out: String,
    // (deliver on this read, byte)
    inbox: VecDeque<(u32, u8)>,
    reads: u32,
}

impl ScriptedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    // `nth` is 1-based; reads must be queued in order
    pub fn deliver_after(&mut self, nth: u32, byte: u8) {
        self.inbox.push_back((nth, byte));
    }

    pub fn reads(&self) -> u32 {
        self.reads
    }

    pub fn output(&self) -> &str {
        &self.out
    }
}

impl fmt::Write for ScriptedConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.out.push_str(s);
        Ok(())
    }
}

impl Console for ScriptedConsole {
    type Error = Infallible;

    fn read_byte(&mut self) -> nb::Result<u8, Infallible> {
        self.reads += 1;
        match self.inbox.front() {
            Some(&(nth, byte)) if nth <= self.reads => {
                self.inbox.pop_front();
                Ok(byte)
            }
            _ => Err(nb::Error::WouldBlock),
        }
    }
}

/// Delay that only adds up what it was asked to sleep.
#[derive(Debug, Default)]
pub struct CountingDelay {
    elapsed_ns: u64,
    calls: u32,
}

impl CountingDelay {
    pub fn calls(&self) -> u32 {
        self.calls
    }

    pub fn elapsed_ms(&self) -> u32 {
        (self.elapsed_ns / 1_000_000) as u32
    }
}

impl DelayNs for CountingDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns += u64::from(ns);
        self.calls += 1;
    }

    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ns += u64::from(ms) * 1_000_000;
        self.calls += 1;
    }
}

#[derive(Debug, Default)]
pub struct FakeWatchdog {
    locked: bool,
    disabled: bool,
    feeds: u32,
}

impl FakeWatchdog {
    pub fn locked() -> Self {
        Self {
            locked: true,
            ..Self::default()
        }
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    pub fn feeds(&self) -> u32 {
        self.feeds
    }
}

impl Watchdog for FakeWatchdog {
    fn feed(&mut self) {
        self.feeds += 1;
    }

    fn disable(&mut self) -> Result<(), WatchdogError> {
        if self.locked {
            return Err(WatchdogError::Locked);
        }
        self.disabled = true;
        Ok(())
    }
}
