//! STM32 USART system-bootloader page programmer.
use std::time::Duration;

use anyhow::Result;
use scroll::{Pwrite, BE};

use crate::{
    constants::{bootloader as cmd, PAGE_SIZE},
    error::ProtocolError,
    transport::{LinkMode, SerialTransport, SharedTransport},
};

/// Page-level access to the companion's flash while it sits in bootloader mode.
pub trait PageProgrammer {
    /// Brings up the serial link the programmer talks over.
    fn start_link(&mut self) -> Result<()>;
    /// Synchronises with the bootloader and prepares flash for writing.
    fn handshake(&mut self) -> Result<()>;
    fn write_page(&mut self, address: u32, page: &[u8; PAGE_SIZE]) -> Result<()>;
    /// Reads the page back; `false` on mismatch.
    fn verify_page(&mut self, address: u32, page: &[u8; PAGE_SIZE]) -> Result<bool>;
    /// Tears the link down. Must be safe to call in any state.
    fn end_connection(&mut self);
}

pub struct Stm32Bootloader {
    transport: SharedTransport,
    command_timeout: Duration,
    erase_timeout: Duration,
}

impl Stm32Bootloader {
    pub fn new(
        transport: SharedTransport,
        command_timeout: Duration,
        erase_timeout: Duration,
    ) -> Self {
        Stm32Bootloader {
            transport,
            command_timeout,
            erase_timeout,
        }
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

fn wait_ack(t: &mut SerialTransport, command: u8, timeout: Duration) -> Result<()> {
    let mut reply = [0u8; 1];
    t.receive(&mut reply, timeout)?;
    match reply[0] {
        cmd::ACK => Ok(()),
        cmd::NACK => Err(ProtocolError::Nack {
            command,
            code: cmd::NACK,
        }
        .into()),
        other => anyhow::bail!("unexpected reply {:#04x} to command {:#04x}", other, command),
    }
}

fn send_command(t: &mut SerialTransport, command: u8, timeout: Duration) -> Result<()> {
    t.transmit(&[command, !command])?;
    wait_ack(t, command, timeout)
}

fn send_address(
    t: &mut SerialTransport,
    command: u8,
    address: u32,
    timeout: Duration,
) -> Result<()> {
    let mut frame = [0u8; 5];
    frame.pwrite_with(address, 0, BE)?;
    frame[4] = checksum(&frame[..4]);
    t.transmit(&frame)?;
    wait_ack(t, command, timeout)
}

impl PageProgrammer for Stm32Bootloader {
    fn start_link(&mut self) -> Result<()> {
        self.transport.lock().start(LinkMode::Bootloader, None)
    }

    fn handshake(&mut self) -> Result<()> {
        let mut t = self.transport.lock();
        t.clear_input()?;
        t.transmit(&[cmd::SYNC])?;
        wait_ack(&mut t, cmd::SYNC, self.command_timeout)?;
        log::debug!("Bootloader synchronised");

        send_command(&mut t, cmd::EXTENDED_ERASE, self.command_timeout)?;
        let mut erase = [0u8; 3];
        erase.pwrite_with(cmd::MASS_ERASE, 0, BE)?;
        erase[2] = checksum(&erase[..2]);
        t.transmit(&erase)?;
        wait_ack(&mut t, cmd::EXTENDED_ERASE, self.erase_timeout)?;
        log::info!("Companion flash erased");
        Ok(())
    }

    fn write_page(&mut self, address: u32, page: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut t = self.transport.lock();
        send_command(&mut t, cmd::WRITE_MEMORY, self.command_timeout)?;
        send_address(&mut t, cmd::WRITE_MEMORY, address, self.command_timeout)?;

        let mut frame = Vec::with_capacity(PAGE_SIZE + 2);
        frame.push((PAGE_SIZE - 1) as u8);
        frame.extend_from_slice(page);
        frame.push(checksum(&frame));
        t.transmit(&frame)?;
        wait_ack(&mut t, cmd::WRITE_MEMORY, self.command_timeout)
    }

    fn verify_page(&mut self, address: u32, page: &[u8; PAGE_SIZE]) -> Result<bool> {
        let mut t = self.transport.lock();
        send_command(&mut t, cmd::READ_MEMORY, self.command_timeout)?;
        send_address(&mut t, cmd::READ_MEMORY, address, self.command_timeout)?;
        let n = (PAGE_SIZE - 1) as u8;
        t.transmit(&[n, !n])?;
        wait_ack(&mut t, cmd::READ_MEMORY, self.command_timeout)?;

        let mut readback = [0u8; PAGE_SIZE];
        t.receive(&mut readback, self.command_timeout)?;
        Ok(readback == *page)
    }

    fn end_connection(&mut self) {
        self.transport.lock().stop();
    }
}
