//! SD/SDHC card driver written in Embedded Rust, based on [sdmmc-spi](https://crates.io/crates/sdmmc-spi).
//!
//! This crate brings an SD version 2 card up over an SPI bus and reads it block by block.
//!
//! Logging goes through [`log`](https://crates.io/crates/log) by default; build with
//! `default-features = false, features = ["defmt-log"]` to log through `defmt` instead.

#![cfg_attr(not(test), no_std)]

pub mod command;
mod config;
mod consts;
mod crc;
mod csd;
mod error;
mod hooks;
mod response;

pub use crate::config::{DefaultSdMmcSpiConfig, SdMmcSpiConfig};
pub use crate::consts::{args, commands, tokens, BLOCK_SIZE};
pub use crate::csd::{CapacityProvider, CsdData, CsdV2};
pub use crate::error::{Error, Stage};
pub use crate::hooks::{BusPower, Watchdog};
pub use crate::response::R1Response;
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};

use crate::{
    crc::crc16,
    response::{R3OcrPayload, R7Payload},
};

use core::{cell::RefCell, marker::PhantomData};
use embedded_hal::blocking::{delay::DelayMs, spi::Transfer};
use size::Size;
use switch_hal::OutputSwitch;

#[cfg(feature = "defmt-log")]
use defmt::{debug, error, info, warn};
#[cfg(feature = "log")]
use log::{debug, error, info, warn};

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
compile_error!("Must enable either log or defmt-log");

/// Error type alias.
type ErrorFor<T> = <T as DiskioDevice>::HardwareError;

/// SD Card SPI driver.
///
/// `Spi` - SPI.
/// `Cs` - Chip select output switch, `on` selects the card.
/// `Delay` - Millisecond delay.
/// `Wdt` - Watchdog restarted inside polls without a ceiling.
/// `Pwr` - Bus power-up hook.
/// `Config` - Config implementation of driver config trait.
pub struct SdMmcSpi<
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Delay: DelayMs<u8>,
    Wdt: Watchdog = (),
    Pwr: BusPower = (),
    Config: SdMmcSpiConfig = DefaultSdMmcSpiConfig,
> {
    spi: RefCell<Spi>,
    cs: RefCell<Cs>,
    delay: Delay,
    watchdog: RefCell<Wdt>,
    power: Pwr,
    status: Status,
    csd: CsdV2,
    config: PhantomData<Config>,
}

impl<Spi, Cs, Delay> SdMmcSpi<Spi, Cs, Delay>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Delay: DelayMs<u8>,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Creates a new [`SdMmcSpi`] without watchdog and with an always powered bus.
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    /// `delay` - delay provider.
    pub fn new(spi: Spi, cs: Cs, delay: Delay) -> Self {
        Self::with_hooks(spi, cs, delay, (), ())
    }
}

impl<Spi, Cs, Delay, Wdt, Pwr, Config> SdMmcSpi<Spi, Cs, Delay, Wdt, Pwr, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Delay: DelayMs<u8>,
    Wdt: Watchdog,
    Pwr: BusPower,
    Config: SdMmcSpiConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Creates a new [`SdMmcSpi`]. No bus activity happens until [`init`](Self::init).
    ///
    /// `watchdog` - restarted on every iteration of an unbounded poll.
    /// `power` - brings the bus up at the start of every initialization.
    pub fn with_hooks(spi: Spi, cs: Cs, delay: Delay, watchdog: Wdt, power: Pwr) -> Self {
        SdMmcSpi {
            spi: RefCell::new(spi),
            cs: RefCell::new(cs),
            delay,
            watchdog: RefCell::new(watchdog),
            power,
            status: StatusFlag::NotInitialized.into(),
            csd: CsdV2::default(),
            config: PhantomData::<Config>,
        }
    }

    /// Releases the collaborators.
    pub fn free(self) -> (Spi, Cs, Delay, Wdt, Pwr) {
        (
            self.spi.into_inner(),
            self.cs.into_inner(),
            self.delay,
            self.watchdog.into_inner(),
            self.power,
        )
    }

    /// Returns `true` once the whole initialization sequence succeeded.
    pub fn is_initialized(&self) -> bool {
        !self.status.contains(StatusFlag::NotInitialized)
    }

    /// Block size, fixed by the protocol.
    pub fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Card capacity in blocks, `0xFFFF_FFFF` if the card isn't initialized.
    pub fn block_count(&self) -> u32 {
        if !self.is_initialized() {
            return u32::MAX;
        }

        self.csd.c_size().wrapping_mul(1024)
    }

    /// Card capacity, if the card is initialized.
    pub fn card_capacity(&self) -> Option<Size> {
        self.is_initialized().then(|| self.csd.card_capacity())
    }

    /// Card Specific Data, if the card is initialized.
    pub fn csd(&self) -> Option<CsdV2> {
        self.is_initialized().then_some(self.csd)
    }

    /// Validate buffer for read/write.
    fn validate_buffer_len(buf_len: usize) -> Result<(), DiskioError<ErrorFor<Self>>> {
        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 {
            error!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            Err(DiskioError::InvalidArgument)
        } else {
            Ok(())
        }
    }

    /// Validate initialzed.
    fn validate_initialized(&self) -> Result<(), DiskioError<ErrorFor<Self>>> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(DiskioError::NotInitialized)
        }
    }

    /// Block address of `lba`, checking that all `block_count` blocks are addressable.
    fn block_address(lba: Lba, block_count: usize) -> Result<u32, DiskioError<ErrorFor<Self>>> {
        let first = u32::try_from(lba).ok();
        let last = first.and_then(|first| {
            u32::try_from(block_count.saturating_sub(1))
                .ok()
                .and_then(|rest| first.checked_add(rest))
        });

        match (first, last) {
            (Some(first), Some(_)) => Ok(first),
            _ => {
                error!("SD block range out of bounds, blocks: {}", block_count);
                Err(DiskioError::InvalidArgument)
            }
        }
    }

    /// Activate chip select.
    fn select(&self) -> Result<(), ErrorFor<Self>> {
        self.cs.borrow_mut().on().map_err(Error::SelectError)
    }

    /// Deactivate chip select.
    fn unselect(&self) -> Result<(), ErrorFor<Self>> {
        self.cs.borrow_mut().off().map_err(Error::SelectError)
    }

    /// CS scope. The card is unselected on every exit path.
    fn cs_scope<R, F>(&self, f: F) -> Result<R, ErrorFor<Self>>
    where
        F: FnOnce(&Self) -> Result<R, ErrorFor<Self>>,
    {
        self.select()?;
        let result = f(self);
        let unselected = self.unselect();

        let value = result?;
        unselected?;
        Ok(value)
    }

    /// CS scope mut.
    fn cs_scope_mut<R, F>(&mut self, f: F) -> Result<R, ErrorFor<Self>>
    where
        F: FnOnce(&mut Self) -> Result<R, ErrorFor<Self>>,
    {
        self.select()?;
        let result = f(self);
        let unselected = self.unselect();

        let value = result?;
        unselected?;
        Ok(value)
    }

    /// Runs one initialization stage, logging where it failed.
    fn run_stage<R, F>(&mut self, stage: Stage, f: F) -> Result<R, ErrorFor<Self>>
    where
        F: FnOnce(&mut Self) -> Result<R, ErrorFor<Self>>,
    {
        debug!("SD stage {:?}", stage);

        f(self).map_err(|err| {
            error!("SD stage {:?} failed", stage);
            err
        })
    }

    /// Send one byte and receive one byte.
    fn transfer(&self, data: u8) -> Result<u8, ErrorFor<Self>> {
        self.spi
            .borrow_mut()
            .transfer(&mut [data])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    fn receive(&self) -> Result<u8, ErrorFor<Self>> {
        self.transfer(tokens::FILLER)
    }

    /// Send a byte to the SD card.
    fn send(&self, data: u8) -> Result<(), ErrorFor<Self>> {
        self.transfer(data).map(|_| ())
    }

    /// Receive a slice from the SD card.
    fn receive_slice(&self, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        for byte in data.iter_mut() {
            *byte = self.receive()?;
        }

        Ok(())
    }

    /// Poll the card until `token_validator` accepts a byte.
    ///
    /// The watchdog is restarted on every iteration, `ceiling` of `None`
    /// polls forever.
    fn poll_token<F: Fn(u8) -> bool>(
        &self,
        ceiling: Option<usize>,
        stage: Stage,
        token_validator: F,
    ) -> Result<u8, ErrorFor<Self>> {
        let mut attempts: usize = 0;

        loop {
            let token = self.receive()?;
            self.watchdog.borrow_mut().restart();

            if token_validator(token) {
                return Ok(token);
            }

            attempts += 1;
            if ceiling.map_or(false, |max| attempts >= max) {
                warn!("SD poll {:?} gave up after {} attempts", stage, attempts);
                return Err(Error::BusyTimeout(stage));
            }
        }
    }

    /// Wait available state of card.
    fn wait_available_state(&self) -> Result<(), ErrorFor<Self>> {
        self.poll_token(Config::WAIT_READY_ATTEMPTS, Stage::WaitReady, |token| {
            token == tokens::AVAILABLE
        })
        .map(|_| ())
    }

    /// Send command implementation.
    fn send_command_impl(&self, cmd: u8, arg: u32) -> Result<R1Response, ErrorFor<Self>> {
        self.wait_available_state()?;

        let mut frame = command::frame(cmd, arg);

        self.spi
            .borrow_mut()
            .transfer(&mut frame)
            .map_err(Error::Transport)?;

        for _ in 0..Config::READ_R1_ATTEMPTS {
            let r1 = R1Response::from(self.receive()?);

            if r1.is_valid() {
                return Ok(r1);
            }
        }

        error!(
            "SD no response to CMD{}, attempts: {}",
            commands::index(cmd),
            Config::READ_R1_ATTEMPTS
        );

        Err(Error::ProtocolTimeout(commands::index(cmd)))
    }

    /// Send command, escaping application commands with CMD55.
    fn send_command(&self, cmd: u8, arg: u32) -> Result<R1Response, ErrorFor<Self>> {
        if (cmd & commands::ACMD_FLAG) != 0 {
            match self.send_command_impl(commands::CMD55, 0x0000_0000) {
                Ok(_) | Err(Error::ProtocolTimeout(_)) => {}
                Err(err) => return Err(err),
            }
        }

        self.send_command_impl(cmd & !commands::ACMD_FLAG, arg)
    }

    /// Read data block following a data token.
    fn read_data(&self, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        let token = self.poll_token(Config::DATA_TOKEN_ATTEMPTS, Stage::DataToken, |token| {
            token != tokens::AVAILABLE
        })?;

        if Config::STRICT_DATA_TOKEN && token != tokens::DATA_START_BLOCK {
            warn!("SD unexpected data token: 0x{:02X}", token);
            return Err(Error::UnexpectedDataToken(token));
        }

        data.fill(tokens::FILLER);
        self.spi
            .borrow_mut()
            .transfer(data)
            .map_err(Error::RegisterTransferFailure)?;

        let card_crc = u16::from_be_bytes([self.receive()?, self.receive()?]);

        if Config::VERIFY_DATA_CRC {
            let host_crc = crc16(data);

            if card_crc != host_crc {
                return Err(Error::CrcError(card_crc, host_crc));
            }
        }

        Ok(())
    }

    /// Read a register sent as a data block.
    fn read_register(&self, cmd: u8, stage: Stage, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        let r1 = self.send_command(cmd, 0x0000_0000)?;

        if r1 != R1Response::READY_STATE {
            return Err(Error::UnexpectedResponse(stage, r1.bits()));
        }

        self.read_data(data)
    }

    /// Bring the bus up.
    fn power_up(&mut self) -> Result<(), ErrorFor<Self>> {
        if self.power.power_up().is_err() {
            error!("SD bus couldn't be powered up");
            self.unselect()?;
            return Err(Error::TransportUnavailable);
        }

        Ok(())
    }

    /// Let the card settle with at least 74 clock cycles while deselected.
    fn synchronize(&mut self) -> Result<(), ErrorFor<Self>> {
        self.unselect()?;

        for _ in 0..Config::SYNC_BYTES {
            self.send(tokens::FILLER)?;
        }

        self.delay.delay_ms(Config::SETTLE_DELAY_MS);

        Ok(())
    }

    /// Enter SD to SPI mode.
    fn enter_idle_state(&self) -> Result<(), ErrorFor<Self>> {
        let r1 = self.send_command(commands::CMD0, 0x0000_0000)?;

        if r1 != R1Response::IN_IDLE_STATE {
            warn!("Wrong response from CMD0: 0x{:02X}", r1.bits());
            return Err(Error::UnexpectedResponse(Stage::IdleState, r1.bits()));
        }

        Ok(())
    }

    /// Verify SD Memory Card interface operating condition.
    fn check_interface_condition(&self) -> Result<(), ErrorFor<Self>> {
        info!("Verifing SD Memory Card interface operating condition");

        if self
            .send_command(commands::CMD8, args::IF_COND_PATTERN)?
            .illegal_command()
        {
            warn!("SD card rejected CMD8, only SD version 2 cards are supported");
            return Err(Error::UnsupportedCard);
        }

        let mut echo: R7Payload = Default::default();
        self.receive_slice(&mut echo)?;

        match echo
            .iter()
            .zip(args::IF_COND_ECHO.iter())
            .find(|(received, expected)| received != expected)
        {
            Some((&received, _)) => {
                warn!(
                    "SD check pattern mismatch: {:02X} {:02X} {:02X} {:02X}",
                    echo[0], echo[1], echo[2], echo[3]
                );
                Err(Error::UnexpectedResponse(Stage::CheckPattern, received))
            }
            None => Ok(()),
        }
    }

    /// Sends host capacity support information until the card leaves idle state.
    fn negotiate_capacity(&self) -> Result<(), ErrorFor<Self>> {
        info!(
            "Sending host capacity support information and activating the card's initialization process"
        );

        let mut attempts: usize = 0;

        loop {
            match self.send_command(commands::ACMD41, args::HOST_CAPACITY_SUPPORT) {
                Ok(r1) if r1 == R1Response::READY_STATE => return Ok(()),
                Ok(_) | Err(Error::ProtocolTimeout(_)) => {}
                Err(err) => return Err(err),
            }

            self.watchdog.borrow_mut().restart();

            attempts += 1;
            if Config::OP_COND_ATTEMPTS.map_or(false, |max| attempts >= max) {
                warn!("SD card still idle after {} ACMD41 attempts", attempts);
                return Err(Error::BusyTimeout(Stage::OperatingCondition));
            }
        }
    }

    /// Read OCR.
    fn read_ocr(&self) -> Result<(), ErrorFor<Self>> {
        let r1 = self.send_command(commands::CMD58, 0x0000_0000)?;

        if r1 != R1Response::READY_STATE {
            return Err(Error::UnexpectedResponse(Stage::ReadOcr, r1.bits()));
        }

        let mut ocr: R3OcrPayload = Default::default();
        self.receive_slice(&mut ocr)?;

        if (ocr[0] & tokens::OCR_CCS) == 0 {
            warn!("SD card doesn't report high capacity, OCR: 0x{:02X}", ocr[0]);
        }

        Ok(())
    }

    /// Read CSD.
    fn read_csd(&self) -> Result<CsdV2, ErrorFor<Self>> {
        let mut csd_data: CsdData = Default::default();

        self.read_register(commands::CMD9, Stage::ReadCsd, &mut csd_data)?;

        Ok(CsdV2::from(csd_data))
    }

    fn init_sequence(&mut self) -> Result<(), ErrorFor<Self>> {
        self.run_stage(Stage::PowerUp, Self::power_up)?;
        self.run_stage(Stage::Synchronization, Self::synchronize)?;

        self.cs_scope_mut(|s| {
            s.run_stage(Stage::IdleState, |s| s.enter_idle_state())?;
            s.run_stage(Stage::InterfaceCondition, |s| s.check_interface_condition())?;
            s.run_stage(Stage::OperatingCondition, |s| s.negotiate_capacity())?;
            s.run_stage(Stage::ReadOcr, |s| s.read_ocr())
        })?;

        self.csd = self.cs_scope_mut(|s| s.run_stage(Stage::ReadCsd, |s| s.read_csd()))?;

        Ok(())
    }

    /// Initialize SD.
    ///
    /// Runs the whole sequence from scratch, whatever the current state is.
    pub fn init(&mut self) -> Result<(), ErrorFor<Self>> {
        info!("SD initialize started");

        self.status = StatusFlag::NotInitialized.into();

        let result = self.init_sequence();

        self.status = match &result {
            Ok(_) => {
                info!(
                    "SD successfully initialized, blocks: {}, capacity: {} bytes",
                    self.csd.c_size().wrapping_mul(1024),
                    self.csd.card_capacity().bytes()
                );
                Status::default()
            }
            Err(_) => StatusFlag::ErrorOccured | StatusFlag::NotInitialized,
        };

        result
    }

    /// Read a single block.
    ///
    /// `address` goes to the card as is, in block units for SDHC cards.
    pub fn read_block(
        &self,
        buf: &mut [u8; BLOCK_SIZE],
        address: u32,
    ) -> Result<(), ErrorFor<Self>> {
        if !self.is_initialized() {
            return Err(Error::BadState);
        }

        self.cs_scope(|s| {
            let r1 = s.send_command(commands::CMD17, address)?;

            if r1 != R1Response::READY_STATE {
                return Err(Error::UnexpectedResponse(Stage::ReadBlock, r1.bits()));
            }

            s.read_data(buf)
        })
    }
}

impl<Spi, Cs, Delay, Wdt, Pwr, Config> DiskioDevice for SdMmcSpi<Spi, Cs, Delay, Wdt, Pwr, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Delay: DelayMs<u8>,
    Wdt: Watchdog,
    Pwr: BusPower,
    Config: SdMmcSpiConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    type HardwareError = Error<Spi::Error, Cs::Error>;

    fn status(&self) -> Status {
        self.status
    }

    fn reset(&mut self) {
        info!("SD reset invoked");
        self.status = StatusFlag::NotInitialized.into();
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        if self.is_initialized() {
            warn!("SD already is initialized");
            return Err(DiskioError::AlreadyInitialized);
        }

        self.init().map_err(DiskioError::Hardware)
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        Self::validate_buffer_len(buf.len())?;
        self.validate_initialized()?;

        let first = Self::block_address(lba, buf.len() / BLOCK_SIZE)?;

        for (index, chunk) in buf.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            let block: &mut [u8; BLOCK_SIZE] = chunk
                .try_into()
                .map_err(|_| DiskioError::InvalidArgument)?;
            let address = first.wrapping_add(index as u32);

            self.read_block(block, address)
                .map_err(DiskioError::Hardware)?;
        }

        Ok(())
    }

    fn write(&self, _buf: &[u8], _lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        warn!("SD write isn't supported");
        Err(DiskioError::NotSupported)
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => {
                self.validate_initialized()?;
                self.cs_scope(|s| s.wait_available_state())
                    .map_err(DiskioError::Hardware)
            }
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = BLOCK_SIZE;
                Ok(())
            }
            _ => Err(DiskioError::NotSupported),
        }
    }
}
