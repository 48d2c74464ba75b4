use bitfield::bitfield;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
    pub busy, _: 7;
}

impl From<u8> for R1Response {
    fn from(byte: u8) -> Self {
        R1Response(byte)
    }
}

impl R1Response {
    /// Card finished its initialization.
    pub const READY_STATE: R1Response = R1Response(0x00);
    /// Card is in idle state and running the initializing process.
    pub const IN_IDLE_STATE: R1Response = R1Response(0x01);

    /// Returns `true` if the start bit is cleared, i.e. the card has answered.
    pub fn is_valid(&self) -> bool {
        !self.busy()
    }

    /// Raw response byte.
    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// R3 OCR payload.
pub type R3OcrPayload = [u8; 4];

/// R7 interface condition payload.
pub type R7Payload = [u8; 4];
