//! Platform collaborators the driver calls besides the bus itself.

/// Liveness signal restarted on every iteration of a poll that may not
/// have a ceiling.
pub trait Watchdog {
    /// Restarts the watchdog timer.
    fn restart(&mut self);
}

/// No watchdog.
impl Watchdog for () {
    fn restart(&mut self) {}
}

impl<F: FnMut()> Watchdog for F {
    fn restart(&mut self) {
        self()
    }
}

/// Brings the bus transport up before the card is touched.
pub trait BusPower {
    type Error: core::fmt::Debug;

    /// Powers the bus up. Must succeed immediately if it's already up.
    fn power_up(&mut self) -> Result<(), Self::Error>;
}

/// Bus is always up.
impl BusPower for () {
    type Error = core::convert::Infallible;

    fn power_up(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
