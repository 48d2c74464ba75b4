//! Command frames.

use crate::consts::{commands, tokens};

/// Length of a command frame in bytes.
pub const FRAME_LEN: usize = 6;

/// Command frame, as clocked out to the card.
pub type Frame = [u8; FRAME_LEN];

/// Frame trailer for a command.
///
/// Only CMD0 and CMD8 are sent while the card still checks CRC, the rest
/// go with a filler byte.
pub const fn trailer(cmd: u8) -> u8 {
    match commands::CMD_BASE | commands::index(cmd) {
        commands::CMD0 => tokens::CMD0_CRC,
        commands::CMD8 => tokens::CMD8_CRC,
        _ => tokens::NO_CRC,
    }
}

/// Builds a command frame: start bits and index, big-endian argument, trailer.
///
/// The ACMD flag is stripped, escaping with CMD55 is up to the caller.
pub fn frame(cmd: u8, arg: u32) -> Frame {
    let arg = arg.to_be_bytes();

    [
        commands::CMD_BASE | commands::index(cmd),
        arg[0],
        arg[1],
        arg[2],
        arg[3],
        trailer(cmd),
    ]
}
