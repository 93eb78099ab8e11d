//! Reset / boot-strap sequencing for the companion MCU.
use std::{fmt, time::Duration};

use embedded_hal::{
    delay::DelayNs,
    digital::{self, ErrorKind, ErrorType, OutputPin},
};

use crate::{
    config::BootConfig,
    transport::{ControlLine, SharedTransport},
};

/// Puts the companion into a boot mode. No acknowledgement exists; the
/// companion is usable once the call returns.
pub trait BootControl: Send {
    fn enter_application_mode(&mut self);
    fn enter_bootloader_mode(&mut self);
}

impl<T: BootControl + ?Sized> BootControl for Box<T> {
    fn enter_application_mode(&mut self) {
        (**self).enter_application_mode()
    }

    fn enter_bootloader_mode(&mut self) {
        (**self).enter_bootloader_mode()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Strap {
    Application,
    Bootloader,
}

pub struct BootModeController<R, B, D> {
    reset: R,
    boot: B,
    delay: D,
    settle_ms: u32,
}

impl<R, B, D> BootModeController<R, B, D>
where
    R: OutputPin,
    B: OutputPin,
    D: DelayNs,
{
    pub fn new(reset: R, boot: B, delay: D, settle_ms: u32) -> Self {
        BootModeController {
            reset,
            boot,
            delay,
            settle_ms,
        }
    }

    fn sequence(&mut self, strap: Strap) {
        log::info!("Resetting companion into {:?} mode", strap);
        if let Err(e) = self.reset.set_high() {
            log::warn!("reset line: {:?}", e);
        }

        let strapped = match strap {
            Strap::Application => self.boot.set_low(),
            Strap::Bootloader => self.boot.set_high(),
        };
        if let Err(e) = strapped {
            log::warn!("boot line: {:?}", e);
        }
        self.delay.delay_ms(self.settle_ms);

        if let Err(e) = self.reset.set_low() {
            log::warn!("reset line: {:?}", e);
        }
        self.delay.delay_ms(self.settle_ms);
        log::debug!("Companion released from reset");
    }
}

impl<R, B, D> BootControl for BootModeController<R, B, D>
where
    R: OutputPin + Send,
    B: OutputPin + Send,
    D: DelayNs + Send,
{
    fn enter_application_mode(&mut self) {
        self.sequence(Strap::Application);
    }

    fn enter_bootloader_mode(&mut self) {
        self.sequence(Strap::Bootloader);
    }
}

/// Thread-sleeping delay.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(ns.into()));
    }
}

#[derive(Debug)]
pub struct PinError(anyhow::Error);

impl fmt::Display for PinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl digital::Error for PinError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// A serial modem line on whichever port the transport currently holds.
pub struct ControlLinePin {
    transport: SharedTransport,
    line: ControlLine,
    inverted: bool,
}

impl ControlLinePin {
    pub fn new(transport: SharedTransport, line: ControlLine, inverted: bool) -> Self {
        ControlLinePin {
            transport,
            line,
            inverted,
        }
    }

    fn drive(&mut self, level: bool) -> Result<(), PinError> {
        self.transport
            .lock()
            .set_control_line(self.line, level != self.inverted)
            .map_err(PinError)
    }
}

impl ErrorType for ControlLinePin {
    type Error = PinError;
}

impl OutputPin for ControlLinePin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.drive(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.drive(true)
    }
}

pub type SerialBootControl = BootModeController<ControlLinePin, ControlLinePin, StdDelay>;

/// Boot control wired to the transport's modem lines per `config`.
pub fn serial_boot_control(transport: &SharedTransport, config: &BootConfig) -> SerialBootControl {
    BootModeController::new(
        ControlLinePin::new(transport.clone(), config.reset_line, config.invert_reset),
        ControlLinePin::new(transport.clone(), config.boot_line, config.invert_boot),
        StdDelay,
        config.settle_ms,
    )
}
