use crate::consts::commands::{index, ACMD41, CMD0, CMD17, CMD55, CMD58, CMD8, CMD9};

/// Initialization and transfer stages, used to tell failure sites apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Stage {
    /// Bringing the bus transport up.
    PowerUp,
    /// Clocking out sync bytes with the card deselected.
    Synchronization,
    /// CMD0, entering the idle state.
    IdleState,
    /// CMD8, interface condition check.
    InterfaceCondition,
    /// CMD8 trailing bytes, echo of the check pattern.
    CheckPattern,
    /// ACMD41, waiting for the card to leave the idle state.
    OperatingCondition,
    /// CMD58, reading the OCR.
    ReadOcr,
    /// CMD9, reading the CSD.
    ReadCsd,
    /// CMD17, reading a data block.
    ReadBlock,
    /// Waiting for the card to release the bus.
    WaitReady,
    /// Waiting for a data token.
    DataToken,
}

/// [`SdMmcSpi`](crate::SdMmcSpi) result error.
///
/// `T` - transport error type.
/// `S` - select switch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    SelectError(S),
    /// Bus transport couldn't be powered up.
    TransportUnavailable,
    /// No response to this command within the R1 attempts.
    ProtocolTimeout(u8),
    /// Response that doesn't fit the stage.
    UnexpectedResponse(Stage, u8),
    /// Card rejected CMD8, an SD version 1 card or not an SD card at all.
    UnsupportedCard,
    /// Transport failed while exchanging a register or block payload.
    RegisterTransferFailure(T),
    /// Byte that ended the data token poll isn't a start block token.
    UnexpectedDataToken(u8),
    /// CRC mismatch (card, host).
    CrcError(u16, u16),
    /// Poll ceiling reached while the card kept the bus busy.
    BusyTimeout(Stage),
    /// Can't perform this operation with the card in this state.
    BadState,
}

impl<T, S> Error<T, S> {
    /// Stage the error is tied to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::TransportUnavailable => Some(Stage::PowerUp),
            Error::UnexpectedResponse(stage, _) | Error::BusyTimeout(stage) => Some(*stage),
            Error::UnsupportedCard => Some(Stage::InterfaceCondition),
            Error::UnexpectedDataToken(_) => Some(Stage::DataToken),
            Error::ProtocolTimeout(cmd) => Stage::of_command(*cmd),
            _ => None,
        }
    }
}

impl Stage {
    /// Stage that issues the command with this index.
    fn of_command(cmd_index: u8) -> Option<Self> {
        const IDLE: u8 = index(CMD0);
        const IF_COND: u8 = index(CMD8);
        const SEND_CSD: u8 = index(CMD9);
        const READ_SINGLE: u8 = index(CMD17);
        const OP_COND: u8 = index(ACMD41);
        const APP_CMD: u8 = index(CMD55);
        const READ_OCR: u8 = index(CMD58);

        match cmd_index {
            IDLE => Some(Stage::IdleState),
            IF_COND => Some(Stage::InterfaceCondition),
            SEND_CSD => Some(Stage::ReadCsd),
            READ_SINGLE => Some(Stage::ReadBlock),
            OP_COND | APP_CMD => Some(Stage::OperatingCondition),
            READ_OCR => Some(Stage::ReadOcr),
            _ => None,
        }
    }
}
