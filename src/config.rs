/// Represents config for [`SdMmcSpi`](crate::SdMmcSpi).
///
/// Every `Option` ceiling set to `None` keeps the matching poll unbounded;
/// such polls restart the watchdog on every iteration.
pub trait SdMmcSpiConfig {
    /// Max attempts to read R1 after a command frame.
    const READ_R1_ATTEMPTS: usize;
    /// Count of `0xFF` bytes clocked out with the card deselected before the first command.
    const SYNC_BYTES: usize;
    /// Delay after the sync bytes, in milliseconds.
    const SETTLE_DELAY_MS: u8;
    /// Max attempts to wait for the card to release the bus.
    const WAIT_READY_ATTEMPTS: Option<usize>;
    /// Max attempts to wait for a data token.
    const DATA_TOKEN_ATTEMPTS: Option<usize>;
    /// Max ACMD41 rounds while the card leaves the idle state.
    const OP_COND_ATTEMPTS: Option<usize>;
    /// Require the data token to be exactly the start block token.
    const STRICT_DATA_TOKEN: bool;
    /// Verify the CRC-16 trailing every data block.
    const VERIFY_DATA_CRC: bool;
}

/// Default implementation of [`SdMmcSpiConfig`](crate::SdMmcSpiConfig).
pub struct DefaultSdMmcSpiConfig;

impl SdMmcSpiConfig for DefaultSdMmcSpiConfig {
    const READ_R1_ATTEMPTS: usize = 20;
    const SYNC_BYTES: usize = 10;
    const SETTLE_DELAY_MS: u8 = 5;
    const WAIT_READY_ATTEMPTS: Option<usize> = None;
    const DATA_TOKEN_ATTEMPTS: Option<usize> = None;
    const OP_COND_ATTEMPTS: Option<usize> = None;
    const STRICT_DATA_TOKEN: bool = true;
    const VERIFY_DATA_CRC: bool = false;
}
