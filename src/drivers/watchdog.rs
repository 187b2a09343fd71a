use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogError {
    /// peripheral refused the write (write-protect still set)
    Locked,
}

impl fmt::Display for WatchdogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchdogError::Locked => write!(f, "watchdog registers locked"),
        }
    }
}

pub trait Watchdog {
    fn feed(&mut self);

    fn disable(&mut self) -> Result<(), WatchdogError>;
}
