// ISR -> main loop handoff for one peripheral backend
//
// Interrupt handlers call raise(); it looks up the armed entry for the
// channel under a critical section and try_sends (raw id, kind) into a
// bounded channel. A full channel drops the event and bumps a counter,
// never blocks. The cooperative side drains with next().
// Counters sit behind a critical section: riscv32imc has no atomic RMW.

use core::cell::{Cell, RefCell};

use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use super::{EventKind, EventMask, IrqError};

pub const MAX_CHANNELS: usize = 32;
pub const LINE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Armed {
    raw: u16,
    mask: EventMask,
}

pub struct IrqLine {
    armed: Mutex<RefCell<[Option<Armed>; MAX_CHANNELS]>>,
    events: Channel<CriticalSectionRawMutex, (u16, EventKind), LINE_CAPACITY>,
    dropped: Mutex<Cell<u32>>,
}

impl Default for IrqLine {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqLine {
    pub const fn new() -> Self {
        Self {
            armed: Mutex::new(RefCell::new([None; MAX_CHANNELS])),
            events: Channel::new(),
            dropped: Mutex::new(Cell::new(0)),
        }
    }

    /// Interrupt-context entry. Returns whether the event was queued.
    pub fn raise(&self, channel: u8, kind: EventKind) -> bool {
        let raw = critical_section::with(|cs| {
            self.armed
                .borrow_ref(cs)
                .get(channel as usize)
                .copied()
                .flatten()
                .filter(|a| a.mask.contains(kind))
                .map(|a| a.raw)
        });
        let Some(raw) = raw else {
            return false;
        };
        if self.events.try_send((raw, kind)).is_err() {
            critical_section::with(|cs| {
                let d = self.dropped.borrow(cs);
                d.set(d.get().wrapping_add(1));
            });
            return false;
        }
        true
    }

    pub(crate) fn arm(&self, channel: u8, raw: u16, mask: EventMask) -> Result<(), IrqError> {
        critical_section::with(|cs| {
            let mut armed = self.armed.borrow_ref_mut(cs);
            let slot = armed
                .get_mut(channel as usize)
                .ok_or(IrqError::ChannelOutOfRange(channel))?;
            if slot.is_some() {
                return Err(IrqError::ChannelBusy(channel));
            }
            *slot = Some(Armed { raw, mask });
            Ok(())
        })
    }

    // true if `raw` was still armed
    pub(crate) fn disarm(&self, raw: u16) -> bool {
        critical_section::with(|cs| {
            let mut armed = self.armed.borrow_ref_mut(cs);
            match armed.iter_mut().find(|s| s.is_some_and(|a| a.raw == raw)) {
                Some(slot) => {
                    *slot = None;
                    true
                }
                None => false,
            }
        })
    }

    /// Forget every armed channel, e.g. after the pins were reconfigured.
    /// Queued events stay queued.
    pub fn disarm_all(&self) {
        critical_section::with(|cs| {
            *self.armed.borrow_ref_mut(cs) = [None; MAX_CHANNELS];
        });
    }

    pub(crate) fn is_armed(&self, raw: u16) -> bool {
        critical_section::with(|cs| {
            self.armed
                .borrow_ref(cs)
                .iter()
                .any(|s| s.is_some_and(|a| a.raw == raw))
        })
    }

    pub(crate) fn next(&self) -> Option<(u16, EventKind)> {
        self.events.try_receive().ok()
    }

    pub fn pending(&self) -> usize {
        self.events.len()
    }

    pub fn dropped(&self) -> u32 {
        critical_section::with(|cs| self.dropped.borrow(cs).get())
    }
}
