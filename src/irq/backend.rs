// Peripheral backends behind the interrupt hub
//
// One variant per peripheral kind that can raise events; the hub picks
// one by matching on the source's kind. Each backend assigns its own raw
// ids and owns the IrqLine its ISR feeds.

use super::line::IrqLine;
use super::{EventKind, EventMask, IrqError, PeripheralKind};

pub const GPIO_CHANNELS: u8 = 32;
pub const ADC_CHANNELS: u8 = 5;

pub enum Backend<'a> {
    Gpio(GpioIrq<'a>),
    Adc(AdcIrq<'a>),
}

impl<'a> Backend<'a> {
    pub fn kind(&self) -> PeripheralKind {
        match self {
            Backend::Gpio(_) => PeripheralKind::Gpio,
            Backend::Adc(_) => PeripheralKind::Adc,
        }
    }

    pub(crate) fn register(
        &mut self,
        channel: u8,
        mask: EventMask,
        threshold_mv: Option<u16>,
    ) -> Result<u16, IrqError> {
        match self {
            Backend::Gpio(gpio) => gpio.register(channel, mask),
            Backend::Adc(adc) => adc.register(channel, mask, threshold_mv),
        }
    }

    pub(crate) fn unregister(&mut self, raw: u16) -> bool {
        match self {
            Backend::Gpio(gpio) => gpio.line.disarm(raw),
            Backend::Adc(adc) => adc.unregister(raw),
        }
    }

    pub(crate) fn poll_next(&mut self) -> Option<(u16, EventKind)> {
        self.line().next()
    }

    pub fn line(&self) -> &'a IrqLine {
        match self {
            Backend::Gpio(gpio) => gpio.line,
            Backend::Adc(adc) => adc.line,
        }
    }
}

// next raw id not armed on `line`; 0 is never handed out
fn fresh_raw(line: &IrqLine, next: &mut u16) -> u16 {
    loop {
        let raw = *next;
        *next = next.wrapping_add(1).max(1);
        if raw != 0 && !line.is_armed(raw) {
            return raw;
        }
    }
}

/// Pin edge/level interrupts. The ISR reads the pin's status and calls
/// [`IrqLine::raise`] with the pin number.
pub struct GpioIrq<'a> {
    line: &'a IrqLine,
    next_raw: u16,
}

impl<'a> GpioIrq<'a> {
    pub fn new(line: &'a IrqLine) -> Self {
        Self { line, next_raw: 1 }
    }

    fn register(&mut self, pin: u8, mask: EventMask) -> Result<u16, IrqError> {
        if pin >= GPIO_CHANNELS {
            return Err(IrqError::ChannelOutOfRange(pin));
        }
        if mask.is_empty() {
            return Err(IrqError::UnsupportedEvent(PeripheralKind::Gpio));
        }
        let raw = fresh_raw(self.line, &mut self.next_raw);
        self.line.arm(pin, raw, mask)?;
        Ok(raw)
    }
}

#[derive(Debug, Clone, Copy)]
struct Watch {
    raw: u16,
    threshold_mv: u16,
    // side of the threshold at the last sample
    above: Option<bool>,
}

/// Threshold crossings on ADC channels. The ADC has no crossing interrupt
/// of its own, so whoever samples the channel feeds [`AdcIrq::sample`].
pub struct AdcIrq<'a> {
    line: &'a IrqLine,
    next_raw: u16,
    watch: [Option<Watch>; ADC_CHANNELS as usize],
}

impl<'a> AdcIrq<'a> {
    pub fn new(line: &'a IrqLine) -> Self {
        Self {
            line,
            next_raw: 1,
            watch: [None; ADC_CHANNELS as usize],
        }
    }

    fn register(&mut self, channel: u8, mask: EventMask, threshold_mv: Option<u16>) -> Result<u16, IrqError> {
        if channel >= ADC_CHANNELS {
            return Err(IrqError::ChannelOutOfRange(channel));
        }
        if mask.is_empty() || !EventMask::EDGES.covers(mask) {
            return Err(IrqError::UnsupportedEvent(PeripheralKind::Adc));
        }
        let threshold_mv = threshold_mv.ok_or(IrqError::MissingThreshold)?;
        let raw = fresh_raw(self.line, &mut self.next_raw);
        self.line.arm(channel, raw, mask)?;
        self.watch[channel as usize] = Some(Watch {
            raw,
            threshold_mv,
            above: None,
        });
        Ok(raw)
    }

    fn unregister(&mut self, raw: u16) -> bool {
        for slot in self.watch.iter_mut() {
            if slot.is_some_and(|w| w.raw == raw) {
                *slot = None;
            }
        }
        self.line.disarm(raw)
    }

    /// Feeds one reading; raises an edge when it crosses the threshold.
    /// The first reading only establishes the side.
    pub fn sample(&mut self, channel: u8, mv: u16) -> bool {
        let Some(Some(w)) = self.watch.get_mut(channel as usize) else {
            return false;
        };
        let above = mv >= w.threshold_mv;
        let prev = w.above.replace(above);
        match prev {
            Some(was) if was != above => {
                let kind = if above {
                    EventKind::RisingEdge
                } else {
                    EventKind::FallingEdge
                };
                self.line.raise(channel, kind)
            }
            _ => false,
        }
    }
}
