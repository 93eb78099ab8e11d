//! In-memory serial port for tests.
use std::{collections::VecDeque, io, sync::Arc, thread, time::Duration};

use anyhow::Result;
use parking_lot::Mutex;

use super::{ControlLine, LinkSettings, Port, PortOpener};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Both ends of a fake serial cable.
#[derive(Clone, Default)]
pub struct Wire {
    inbound: Arc<Mutex<VecDeque<u8>>>,
    outbound: Arc<Mutex<Vec<u8>>>,
    write_sizes: Arc<Mutex<Vec<usize>>>,
    lines: Arc<Mutex<Vec<(ControlLine, bool)>>>,
    opened: Arc<Mutex<Vec<u32>>>,
    responder: Arc<Mutex<Option<Responder>>>,
}

impl Wire {
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.inbound.lock().extend(bytes);
    }

    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut *self.outbound.lock())
    }

    pub fn write_sizes(&self) -> Vec<usize> {
        self.write_sizes.lock().clone()
    }

    pub fn lines(&self) -> Vec<(ControlLine, bool)> {
        self.lines.lock().clone()
    }

    pub fn opened_bauds(&self) -> Vec<u32> {
        self.opened.lock().clone()
    }

    /// Replies produced by `f` for every write are queued as inbound bytes.
    pub fn respond_with(&self, f: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) {
        *self.responder.lock() = Some(Box::new(f));
    }
}

pub struct ScriptedPort {
    wire: Wire,
}

impl Port for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.wire.inbound.lock();
        if inbound.is_empty() {
            drop(inbound);
            thread::sleep(Duration::from_millis(1));
            return Err(io::ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(inbound.len());
        for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.wire.outbound.lock().extend_from_slice(buf);
        self.wire.write_sizes.lock().push(buf.len());
        if let Some(responder) = self.wire.responder.lock().as_mut() {
            let reply = responder(buf);
            self.wire.inbound.lock().extend(reply);
        }
        Ok(buf.len())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.wire.inbound.lock().clear();
        Ok(())
    }

    fn set_control_line(&mut self, line: ControlLine, level: bool) -> Result<()> {
        self.wire.lines.lock().push((line, level));
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn Port>> {
        Ok(Box::new(ScriptedPort {
            wire: self.wire.clone(),
        }))
    }
}

pub struct ScriptedOpener {
    wire: Wire,
}

impl ScriptedOpener {
    pub fn new(wire: Wire) -> Self {
        ScriptedOpener { wire }
    }
}

impl PortOpener for ScriptedOpener {
    fn open(&self, settings: &LinkSettings) -> Result<Box<dyn Port>> {
        self.wire.opened.lock().push(settings.baud);
        Ok(Box::new(ScriptedPort {
            wire: self.wire.clone(),
        }))
    }
}
