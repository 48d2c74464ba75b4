/// Size of a data block in bytes.
pub const BLOCK_SIZE: usize = 512;
/// Size of a data block in bytes, `u64` flavour.
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;

pub mod commands {
    /// CMD base value.
    pub const CMD_BASE: u8 = 0x40;
    /// ACMD flag.
    pub const ACMD_FLAG: u8 = 0x80;
    /// GO_IDLE_STATE - init card in spi mode if CS low.
    pub const CMD0: u8 = CMD_BASE;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = CMD_BASE + 8;
    /// SEND_CSD - read the Card Specific Data (CSD register).
    pub const CMD9: u8 = CMD_BASE + 9;
    /// SEND_CID - read the card identification information (CID register).
    pub const CMD10: u8 = CMD_BASE + 10;
    /// SEND_STATUS - read the card status register.
    pub const CMD13: u8 = CMD_BASE + 13;
    /// READ_SINGLE_BLOCK - read a single data block from the card.
    pub const CMD17: u8 = CMD_BASE + 17;
    /// WRITE_BLOCK - write a single data block to the card.
    pub const CMD24: u8 = CMD_BASE + 24;
    /// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION.
    pub const CMD25: u8 = CMD_BASE + 25;
    /// ERASE_WR_BLK_START - sets the address of the first block to be erased.
    pub const CMD32: u8 = CMD_BASE + 32;
    /// ERASE_WR_BLK_END - sets the address of the last block to be erased.
    pub const CMD33: u8 = CMD_BASE + 33;
    /// ERASE - erase all previously selected blocks.
    pub const CMD38: u8 = CMD_BASE + 38;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = CMD_BASE + 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = CMD_BASE + 58;
    /// SET_WR_BLK_ERASE_COUNT - set the number of write blocks to be pre-erased.
    pub const ACMD23: u8 = CMD_BASE + ACMD_FLAG + 23;
    /// SD_SEND_OP_COMD - Sends host capacity support information and activates
    /// the card's initialization process.
    pub const ACMD41: u8 = CMD_BASE + ACMD_FLAG + 41;

    /// Returns the command index, without base and ACMD flag.
    pub const fn index(cmd: u8) -> u8 {
        cmd & 0x3F
    }
}

pub mod args {
    /// CMD8 argument: 2.7-3.6V supply and `0xAA` check pattern.
    pub const IF_COND_PATTERN: u32 = 0x0000_01AA;
    /// Expected CMD8 trailing bytes, echo of [`IF_COND_PATTERN`].
    pub const IF_COND_ECHO: [u8; 4] = IF_COND_PATTERN.to_be_bytes();
    /// ACMD41 argument: host supports high capacity cards.
    pub const HOST_CAPACITY_SUPPORT: u32 = 0x4000_0000;
}

pub mod tokens {
    /// Value returned by a card that doesn't drive the bus.
    pub const AVAILABLE: u8 = 0xFF;
    /// Filler byte clocked out while receiving.
    pub const FILLER: u8 = 0xFF;
    /// Frame trailer for CMD0, a valid CRC that is required before SPI mode.
    pub const CMD0_CRC: u8 = 0x95;
    /// Frame trailer for CMD8, a valid CRC for the check pattern argument.
    pub const CMD8_CRC: u8 = 0x87;
    /// Frame trailer for every other command.
    pub const NO_CRC: u8 = 0xFF;
    /// Card capacity status bit in the first OCR byte.
    pub const OCR_CCS: u8 = 0x40;
    /// Start data token for read or write single block.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Stop token for write multiple blocks.
    pub const STOP_TRAN: u8 = 0xFD;
    /// Start data token for write multiple blocks.
    pub const WRITE_MULTIPLE: u8 = 0xFC;
    /// Mask for data response tokens after a write block operation.
    pub const DATA_RES_MASK: u8 = 0x1F;
    /// Write data accepted token.
    pub const DATA_RES_ACCEPTED: u8 = 0x05;
}
