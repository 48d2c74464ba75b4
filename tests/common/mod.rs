//! Simulated SD card on a mock SPI bus.

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    convert::Infallible,
    mem,
    rc::Rc,
};

use embedded_hal::blocking::{delay::DelayMs, spi::Transfer};
use hex_literal::hex;
use sdcard_spi::{BusPower, DefaultSdMmcSpiConfig, SdMmcSpi, SdMmcSpiConfig, Watchdog};
use switch_hal::OutputSwitch;

/// 8 GB SDHC card, C_SIZE `0x3B37`.
pub const CSD_8GB: [u8; 16] = hex!("40 0E 00 32 5B 59 00 00 3B 37 7F 80 0A 40 40 AF");
/// Largest C_SIZE the high/mid/low bytes can hold.
pub const CSD_MAX: [u8; 16] = hex!("40 0E 00 32 5B 59 00 3F FF FF 7F 80 0A 40 40 01");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiFault;

#[derive(Debug)]
pub struct PowerFault;

/// Card side of the bus.
pub struct Card {
    pub selected: bool,
    pub selects: usize,
    pub deselects: usize,
    /// Bytes clocked while deselected.
    pub sync_bytes: usize,
    /// Received frames, in order.
    pub frames: Vec<[u8; 6]>,
    pub transfers: usize,

    /// CMD0 answer, `None` never answers.
    pub idle_response: Option<u8>,
    pub if_cond_response: u8,
    pub if_cond_echo: [u8; 4],
    /// ACMD41 rounds answered with the idle state.
    pub busy_rounds: usize,
    pub ocr_response: u8,
    pub ocr: [u8; 4],
    pub csd_response: u8,
    pub csd: [u8; 16],
    /// CMD17 answer, `None` never answers.
    pub read_response: Option<u8>,
    pub data_token: u8,
    /// `0xFF` bytes before the data token.
    pub token_delay: usize,
    /// `0xFF` bytes before an R1.
    pub response_delay: usize,
    /// `0x00` bytes the card holds the bus with, while selected and idle.
    pub busy: usize,
    pub corrupt_crc: bool,
    /// Transfers at least this long fail.
    pub fail_transfers_from: Option<usize>,
    pub power_fails: bool,
    pub power_ups: usize,

    ready: bool,
    app_escape: bool,
    frame: Vec<u8>,
    out: VecDeque<u8>,
}

impl Card {
    /// Well behaved SDHC card.
    pub fn sdhc(csd: [u8; 16]) -> Self {
        Card {
            selected: false,
            selects: 0,
            deselects: 0,
            sync_bytes: 0,
            frames: Vec::new(),
            transfers: 0,
            idle_response: Some(0x01),
            if_cond_response: 0x01,
            if_cond_echo: [0x00, 0x00, 0x01, 0xAA],
            busy_rounds: 0,
            ocr_response: 0x00,
            ocr: [0xC0, 0xFF, 0x80, 0x00],
            csd_response: 0x00,
            csd,
            read_response: Some(0x00),
            data_token: 0xFE,
            token_delay: 0,
            response_delay: 1,
            busy: 0,
            corrupt_crc: false,
            fail_transfers_from: None,
            power_fails: false,
            power_ups: 0,
            ready: false,
            app_escape: false,
            frame: Vec::new(),
            out: VecDeque::new(),
        }
    }

    /// Command indexes received, in order.
    pub fn commands(&self) -> Vec<u8> {
        self.frames.iter().map(|frame| frame[0] & 0x3F).collect()
    }

    /// Arguments received with the command index.
    pub fn args_of(&self, index: u8) -> Vec<u32> {
        self.frames
            .iter()
            .filter(|frame| frame[0] & 0x3F == index)
            .map(|frame| u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]))
            .collect()
    }

    pub fn count_of(&self, index: u8) -> usize {
        self.args_of(index).len()
    }

    fn select(&mut self, selected: bool) {
        if selected {
            self.selects += 1;
        } else {
            self.deselects += 1;
            self.frame.clear();
            self.out.clear();
        }
        self.selected = selected;
    }

    fn exchange(&mut self, words: &mut [u8]) -> Result<(), SpiFault> {
        self.transfers += 1;

        if self.fail_transfers_from.map_or(false, |len| words.len() >= len) {
            return Err(SpiFault);
        }

        for word in words.iter_mut() {
            let input = *word;
            *word = self.output();
            self.input(input);
        }

        Ok(())
    }

    fn output(&mut self) -> u8 {
        if !self.selected {
            return 0xFF;
        }
        if let Some(byte) = self.out.pop_front() {
            return byte;
        }
        if self.busy > 0 {
            self.busy -= 1;
            return 0x00;
        }
        0xFF
    }

    fn input(&mut self, byte: u8) {
        if !self.selected {
            self.sync_bytes += 1;
            return;
        }
        if self.frame.is_empty() && (byte & 0xC0) != 0x40 {
            return;
        }

        self.frame.push(byte);

        if self.frame.len() == 6 {
            let frame = mem::take(&mut self.frame);
            let frame: [u8; 6] = frame.try_into().unwrap();
            self.frames.push(frame);
            self.respond(
                frame[0] & 0x3F,
                u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]),
            );
        }
    }

    fn r1(&mut self, r1: u8) {
        self.out.extend(std::iter::repeat(0xFF).take(self.response_delay));
        self.out.push_back(r1);
    }

    fn data(&mut self, payload: &[u8]) {
        let mut crc = crc16(payload);
        if self.corrupt_crc {
            crc ^= 0xFFFF;
        }

        self.out.extend(std::iter::repeat(0xFF).take(self.token_delay));
        self.out.push_back(self.data_token);
        self.out.extend(payload.iter().copied());
        self.out.extend(crc.to_be_bytes());
    }

    fn respond(&mut self, index: u8, arg: u32) {
        let app = mem::replace(&mut self.app_escape, false);

        match (app, index) {
            (_, 0) => {
                self.ready = false;
                if let Some(r1) = self.idle_response {
                    self.r1(r1);
                }
            }
            (_, 8) => {
                self.r1(self.if_cond_response);
                if self.if_cond_response & 0x04 == 0 {
                    let echo = self.if_cond_echo;
                    self.out.extend(echo);
                }
            }
            (_, 55) => {
                self.app_escape = true;
                self.r1(if self.ready { 0x00 } else { 0x01 });
            }
            (true, 41) => {
                if self.busy_rounds > 0 {
                    self.busy_rounds -= 1;
                    self.r1(0x01);
                } else {
                    self.ready = true;
                    self.r1(0x00);
                }
            }
            (_, 58) => {
                self.r1(self.ocr_response);
                if self.ocr_response == 0 {
                    let ocr = self.ocr;
                    self.out.extend(ocr);
                }
            }
            (_, 9) => {
                self.r1(self.csd_response);
                if self.csd_response == 0 {
                    let csd = self.csd;
                    self.data(&csd);
                }
            }
            (_, 17) => {
                if let Some(r1) = self.read_response {
                    self.r1(r1);
                    if r1 == 0 {
                        self.data(&block_for(arg));
                    }
                }
            }
            _ => self.r1(0x04),
        }
    }
}

/// Content of a block at `address`.
pub fn block_for(address: u32) -> [u8; 512] {
    let mut block = [0u8; 512];
    for (i, byte) in block.iter_mut().enumerate() {
        *byte = (address as u8).wrapping_mul(31) ^ (i as u8) ^ ((i >> 8) as u8);
    }
    block
}

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

pub struct MockSpi(Rc<RefCell<Card>>);

impl Transfer<u8> for MockSpi {
    type Error = SpiFault;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        self.0.borrow_mut().exchange(words)?;
        Ok(words)
    }
}

pub struct MockCs(Rc<RefCell<Card>>);

impl OutputSwitch for MockCs {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().select(true);
        Ok(())
    }

    fn off(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().select(false);
        Ok(())
    }
}

pub struct MockDelay(Rc<Cell<u32>>);

impl DelayMs<u8> for MockDelay {
    fn delay_ms(&mut self, ms: u8) {
        self.0.set(self.0.get() + u32::from(ms));
    }
}

pub struct WdtCounter(Rc<Cell<usize>>);

impl Watchdog for WdtCounter {
    fn restart(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

pub struct MockPower(Rc<RefCell<Card>>);

impl BusPower for MockPower {
    type Error = PowerFault;

    fn power_up(&mut self) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();
        card.power_ups += 1;
        if card.power_fails {
            Err(PowerFault)
        } else {
            Ok(())
        }
    }
}

pub type Sd<C = DefaultSdMmcSpiConfig> = SdMmcSpi<MockSpi, MockCs, MockDelay, WdtCounter, MockPower, C>;

/// Driver error against the simulated card.
pub type SdError = sdcard_spi::Error<SpiFault, Infallible>;

/// Simulated card with the driver's collaborators.
pub struct Rig {
    pub card: Rc<RefCell<Card>>,
    pub delay_ms: Rc<Cell<u32>>,
    pub watchdog: Rc<Cell<usize>>,
}

impl Rig {
    pub fn new(card: Card) -> Self {
        Rig {
            card: Rc::new(RefCell::new(card)),
            delay_ms: Rc::new(Cell::new(0)),
            watchdog: Rc::new(Cell::new(0)),
        }
    }

    pub fn driver_with<C: SdMmcSpiConfig>(&self) -> Sd<C> {
        SdMmcSpi::with_hooks(
            MockSpi(self.card.clone()),
            MockCs(self.card.clone()),
            MockDelay(self.delay_ms.clone()),
            WdtCounter(self.watchdog.clone()),
            MockPower(self.card.clone()),
        )
    }

    pub fn driver(&self) -> Sd {
        self.driver_with::<DefaultSdMmcSpiConfig>()
    }

    /// Driver that already went through a successful initialization.
    pub fn ready_driver_with<C: SdMmcSpiConfig>(&self) -> Sd<C> {
        let mut sd = self.driver_with::<C>();
        sd.init().unwrap();
        self.card.borrow_mut().frames.clear();
        sd
    }

    pub fn ready_driver(&self) -> Sd {
        self.ready_driver_with::<DefaultSdMmcSpiConfig>()
    }

    pub fn selected(&self) -> bool {
        self.card.borrow().selected
    }
}

/// Polls that give up quickly.
pub struct CeilingConfig;

impl SdMmcSpiConfig for CeilingConfig {
    const READ_R1_ATTEMPTS: usize = 20;
    const SYNC_BYTES: usize = 10;
    const SETTLE_DELAY_MS: u8 = 5;
    const WAIT_READY_ATTEMPTS: Option<usize> = Some(10);
    const DATA_TOKEN_ATTEMPTS: Option<usize> = Some(10);
    const OP_COND_ATTEMPTS: Option<usize> = Some(3);
    const STRICT_DATA_TOKEN: bool = true;
    const VERIFY_DATA_CRC: bool = false;
}

/// Any byte but `0xFF` starts a data block.
pub struct LaxTokenConfig;

impl SdMmcSpiConfig for LaxTokenConfig {
    const READ_R1_ATTEMPTS: usize = 20;
    const SYNC_BYTES: usize = 10;
    const SETTLE_DELAY_MS: u8 = 5;
    const WAIT_READY_ATTEMPTS: Option<usize> = None;
    const DATA_TOKEN_ATTEMPTS: Option<usize> = None;
    const OP_COND_ATTEMPTS: Option<usize> = None;
    const STRICT_DATA_TOKEN: bool = false;
    const VERIFY_DATA_CRC: bool = false;
}

/// Data blocks are checked against their CRC.
pub struct CrcConfig;

impl SdMmcSpiConfig for CrcConfig {
    const READ_R1_ATTEMPTS: usize = 20;
    const SYNC_BYTES: usize = 10;
    const SETTLE_DELAY_MS: u8 = 5;
    const WAIT_READY_ATTEMPTS: Option<usize> = None;
    const DATA_TOKEN_ATTEMPTS: Option<usize> = None;
    const OP_COND_ATTEMPTS: Option<usize> = None;
    const STRICT_DATA_TOKEN: bool = true;
    const VERIFY_DATA_CRC: bool = true;
}
