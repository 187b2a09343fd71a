// Control stream: text out, single bytes in.
// Reads never block; an empty receive FIFO is nb::Error::WouldBlock.

use core::fmt;

pub trait Console: fmt::Write {
    type Error: fmt::Debug;

    fn read_byte(&mut self) -> nb::Result<u8, Self::Error>;
}

/// Console that never receives anything and discards output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullConsole;

impl fmt::Write for NullConsole {
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        Ok(())
    }
}

impl Console for NullConsole {
    type Error = core::convert::Infallible;

    fn read_byte(&mut self) -> nb::Result<u8, Self::Error> {
        Err(nb::Error::WouldBlock)
    }
}
