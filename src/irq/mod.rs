//! Interrupt event queue.
//!
//! Hardware edges and levels are buffered by ISRs into per-backend
//! [`IrqLine`]s; nothing runs in interrupt context beyond that. The
//! cooperative side drains them through [`IrqHub::process`], which
//! dispatches each event to the handler registered for it.
//!
//! Handlers are closures. Whatever they need from the caller is either
//! moved into the closure or handed over as the registration's
//! `capture`, which the hub passes back on every call.

pub mod backend;
pub mod line;

pub use backend::{AdcIrq, Backend, GpioIrq};
pub use line::IrqLine;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::ops::BitOr;

use log::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RisingEdge,
    FallingEdge,
    LevelLow,
    LevelHigh,
}

impl EventKind {
    pub const fn bit(self) -> u8 {
        match self {
            EventKind::RisingEdge => 1 << 0,
            EventKind::FallingEdge => 1 << 1,
            EventKind::LevelLow => 1 << 2,
            EventKind::LevelHigh => 1 << 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: Self = Self(0);
    pub const RISING: Self = Self(EventKind::RisingEdge.bit());
    pub const FALLING: Self = Self(EventKind::FallingEdge.bit());
    pub const LOW: Self = Self(EventKind::LevelLow.bit());
    pub const HIGH: Self = Self(EventKind::LevelHigh.bit());
    pub const EDGES: Self = Self(Self::RISING.0 | Self::FALLING.0);
    pub const ALL: Self = Self(0x0f);

    pub const fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    // every bit of `other` is in self
    pub const fn covers(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 & Self::ALL.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<EventKind> for EventMask {
    fn from(kind: EventKind) -> Self {
        Self(kind.bit())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeripheralKind {
    Gpio,
    Adc,
    Uart,
    I2c,
    Spi,
    Pwm,
}

impl PeripheralKind {
    pub const fn name(self) -> &'static str {
        match self {
            PeripheralKind::Gpio => "gpio",
            PeripheralKind::Adc => "adc",
            PeripheralKind::Uart => "uart",
            PeripheralKind::I2c => "i2c",
            PeripheralKind::Spi => "spi",
            PeripheralKind::Pwm => "pwm",
        }
    }
}

/// A pin or channel on one peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Source {
    pub kind: PeripheralKind,
    pub channel: u8,
}

impl Source {
    pub const fn gpio(pin: u8) -> Self {
        Self {
            kind: PeripheralKind::Gpio,
            channel: pin,
        }
    }

    pub const fn adc(channel: u8) -> Self {
        Self {
            kind: PeripheralKind::Adc,
            channel,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.name(), self.channel)
    }
}

/// Registration handle, assigned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqId {
    kind: PeripheralKind,
    raw: u16,
}

impl IrqId {
    pub const fn kind(self) -> PeripheralKind {
        self.kind
    }

    pub const fn raw(self) -> u16 {
        self.raw
    }
}

impl fmt::Display for IrqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.name(), self.raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// No backend for this peripheral kind
    Unsupported(PeripheralKind),
    NotRegistered(IrqId),
    ChannelOutOfRange(u8),
    ChannelBusy(u8),
    /// Mask asks for events the peripheral cannot produce
    UnsupportedEvent(PeripheralKind),
    MissingThreshold,
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrqError::Unsupported(kind) => write!(f, "{} cannot raise interrupts", kind.name()),
            IrqError::NotRegistered(id) => write!(f, "{} not registered", id),
            IrqError::ChannelOutOfRange(ch) => write!(f, "channel {} out of range", ch),
            IrqError::ChannelBusy(ch) => write!(f, "channel {} already has a handler", ch),
            IrqError::UnsupportedEvent(kind) => {
                write!(f, "event type not supported on {}", kind.name())
            }
            IrqError::MissingThreshold => write!(f, "threshold required"),
        }
    }
}

/// Failure reported by a handler. Logged and counted by the hub; never
/// stops the rest of the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqEvent {
    pub id: IrqId,
    pub source: Source,
    pub kind: EventKind,
}

pub struct IrqOptions<C> {
    pub enabled: bool,
    /// ADC only: crossing level in millivolts
    pub threshold_mv: Option<u16>,
    /// handed back to the handler on every call
    pub capture: C,
}

impl<C> IrqOptions<C> {
    pub fn capture(capture: C) -> Self {
        Self {
            enabled: true,
            threshold_mv: None,
            capture,
        }
    }

    pub fn threshold(mut self, mv: u16) -> Self {
        self.threshold_mv = Some(mv);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl<C: Default> Default for IrqOptions<C> {
    fn default() -> Self {
        Self::capture(C::default())
    }
}

/// Anything a blocked caller can drain between quanta.
pub trait EventQueue {
    /// Handles at most `max` queued events; returns how many handlers ran.
    fn process(&mut self, max: usize) -> usize;
}

type Handler<'a, C> = Box<dyn FnMut(&IrqEvent, &mut C) -> Result<(), HandlerError> + 'a>;

struct Registration<'a, C> {
    source: Source,
    mask: EventMask,
    enabled: bool,
    capture: C,
    handler: Handler<'a, C>,
}

pub struct IrqHub<'a, C = ()> {
    backends: Vec<Backend<'a>>,
    handlers: BTreeMap<IrqId, Registration<'a, C>>,
    faults: u32,
    // events whose registration was gone or muted
    discarded: u32,
    // where the last round-robin pass stopped
    cursor: usize,
}

impl<C> Default for IrqHub<'_, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, C> IrqHub<'a, C> {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
            handlers: BTreeMap::new(),
            faults: 0,
            discarded: 0,
            cursor: 0,
        }
    }

    /// Installs the backend for its peripheral kind, replacing any
    /// earlier one.
    pub fn attach(&mut self, backend: Backend<'a>) {
        let kind = backend.kind();
        self.backends.retain(|b| b.kind() != kind);
        self.backends.push(backend);
        info!("irq: {} backend attached", kind.name());
    }

    fn backend_mut(&mut self, kind: PeripheralKind) -> Option<&mut Backend<'a>> {
        self.backends.iter_mut().find(|b| b.kind() == kind)
    }

    pub fn register<H>(
        &mut self,
        source: Source,
        mask: EventMask,
        options: IrqOptions<C>,
        handler: H,
    ) -> Result<IrqId, IrqError>
    where
        H: FnMut(&IrqEvent, &mut C) -> Result<(), HandlerError> + 'a,
    {
        let backend = self
            .backend_mut(source.kind)
            .ok_or(IrqError::Unsupported(source.kind))?;
        let raw = backend.register(source.channel, mask, options.threshold_mv)?;
        let id = IrqId {
            kind: source.kind,
            raw,
        };
        self.handlers.insert(
            id,
            Registration {
                source,
                mask,
                enabled: options.enabled,
                capture: options.capture,
                handler: Box::new(handler),
            },
        );
        info!("irq: {} registered for {}", id, source);
        Ok(id)
    }

    /// Removes the handler. Ok(false) means the peripheral side had
    /// already let go of it.
    pub fn unregister(&mut self, id: IrqId) -> Result<bool, IrqError> {
        if self.handlers.remove(&id).is_none() {
            return Err(IrqError::NotRegistered(id));
        }
        let active = self
            .backend_mut(id.kind)
            .is_some_and(|b| b.unregister(id.raw));
        info!("irq: {} unregistered", id);
        Ok(active)
    }

    /// Mutes or unmutes a handler. Returns the previous setting.
    pub fn set_enabled(&mut self, id: IrqId, enabled: bool) -> Result<bool, IrqError> {
        let reg = self
            .handlers
            .get_mut(&id)
            .ok_or(IrqError::NotRegistered(id))?;
        Ok(core::mem::replace(&mut reg.enabled, enabled))
    }

    pub fn enable(&mut self, id: IrqId) -> Result<bool, IrqError> {
        self.set_enabled(id, true)
    }

    pub fn disable(&mut self, id: IrqId) -> Result<bool, IrqError> {
        self.set_enabled(id, false)
    }

    pub fn is_enabled(&self, id: IrqId) -> Option<bool> {
        self.handlers.get(&id).map(|r| r.enabled)
    }

    pub fn is_registered(&self, id: IrqId) -> bool {
        self.handlers.contains_key(&id)
    }

    pub fn capture(&self, id: IrqId) -> Option<&C> {
        self.handlers.get(&id).map(|r| &r.capture)
    }

    pub fn events_for(&self, id: IrqId) -> Option<EventMask> {
        self.handlers.get(&id).map(|r| r.mask)
    }

    /// ADC readings feed threshold detection; see [`AdcIrq::sample`].
    pub fn sample_adc(&mut self, channel: u8, mv: u16) -> bool {
        match self.backend_mut(PeripheralKind::Adc) {
            Some(Backend::Adc(adc)) => adc.sample(channel, mv),
            _ => false,
        }
    }

    /// Drains at most `max` queued events, FIFO per backend, taking one
    /// from each backend in turn. Returns how many handlers ran. Stops as
    /// soon as every queue is empty.
    pub fn process(&mut self, max: usize) -> usize {
        let mut drained = 0;
        let mut handled = 0;
        let n = self.backends.len();
        let mut idle = 0;

        while drained < max && n > 0 && idle < n {
            let at = self.cursor % n;
            self.cursor = (at + 1) % n;
            let kind = self.backends[at].kind();
            let Some((raw, ev_kind)) = self.backends[at].poll_next() else {
                idle += 1;
                continue;
            };
            idle = 0;
            drained += 1;

            let id = IrqId { kind, raw };
            let Some(reg) = self.handlers.get_mut(&id) else {
                // unregistered after the ISR queued it
                debug!("irq: {} gone, event dropped", id);
                self.discarded += 1;
                continue;
            };
            if !reg.enabled {
                self.discarded += 1;
                continue;
            }

            let event = IrqEvent {
                id,
                source: reg.source,
                kind: ev_kind,
            };
            handled += 1;
            if let Err(e) = (reg.handler)(&event, &mut reg.capture) {
                self.faults = self.faults.wrapping_add(1);
                error!("irq: handler for {} failed: {}", id, e);
            }
        }
        handled
    }

    pub fn pending(&self) -> usize {
        self.backends.iter().map(|b| b.line().pending()).sum()
    }

    // ISR-side overflow, summed over backends
    pub fn dropped(&self) -> u32 {
        self.backends.iter().map(|b| b.line().dropped()).sum()
    }

    pub fn discarded(&self) -> u32 {
        self.discarded
    }

    pub fn faults(&self) -> u32 {
        self.faults
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<C> EventQueue for IrqHub<'_, C> {
    fn process(&mut self, max: usize) -> usize {
        IrqHub::process(self, max)
    }
}
