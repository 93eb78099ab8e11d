//! Host serial ports.
use std::io::{self, Read, Write};

use anyhow::{Error, Result};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::{ControlLine, LinkSettings, Port, PortOpener};

pub struct SystemPort(Box<dyn SerialPort>);

impl Port for SystemPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.0.write(buf)?;
        self.0.flush()?;
        Ok(n)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.0.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn set_control_line(&mut self, line: ControlLine, level: bool) -> Result<()> {
        match line {
            ControlLine::Rts => self.0.write_request_to_send(level)?,
            ControlLine::Dtr => self.0.write_data_terminal_ready(level)?,
        }
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn Port>> {
        Ok(Box::new(SystemPort(self.0.try_clone()?)))
    }
}

/// Opens a named port, or the first one found.
#[derive(Debug, Clone, Default)]
pub struct SystemPorts {
    path: Option<String>,
}

impl SystemPorts {
    pub fn new(path: Option<String>) -> Self {
        SystemPorts { path }
    }

    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    fn resolve(&self) -> Result<String> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        Self::scan_ports()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::msg("No serial ports found!"))
    }
}

impl PortOpener for SystemPorts {
    fn open(&self, settings: &LinkSettings) -> Result<Box<dyn Port>> {
        let path = self.resolve()?;
        log::debug!("Opening serial port: \"{}\" @ {} baud", path, settings.baud);
        let port = serialport::new(&path, settings.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::Even)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.read_timeout)
            .open()?;
        Ok(Box::new(SystemPort(port)))
    }
}
