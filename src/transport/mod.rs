//! Serial link to the companion device.
//!
//! The peripheral is owned by exactly one mode at a time. Bootloader mode is a
//! plain blocking port; Application mode adds a driver thread that pumps
//! received bytes into an RX ring plus event queue, and a consumer thread that
//! drains the ring into a [`ByteSink`].
use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    config::SerialConfig,
    constants::{EVENT_QUEUE_DEPTH, MAX_DMA_TRANSFER, RX_BUFFER_SIZE},
};

pub use self::serial::{SystemPort, SystemPorts};

mod serial;
#[cfg(test)]
pub(crate) mod testing;

pub type SharedTransport = Arc<Mutex<SerialTransport>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkMode {
    Bootloader,
    Application,
}

/// Modem control lines usable as reset / boot strap outputs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlLine {
    Rts,
    Dtr,
}

/// Port parameters. Framing is always 8 data bits, even parity, 1 stop bit,
/// no flow control.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkSettings {
    pub baud: u32,
    pub read_timeout: Duration,
}

/// A single open driver instance.
pub trait Port: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn clear_input(&mut self) -> Result<()>;
    fn set_control_line(&mut self, line: ControlLine, level: bool) -> Result<()>;
    fn try_clone(&self) -> Result<Box<dyn Port>>;

    fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

pub trait PortOpener: Send {
    fn open(&self, settings: &LinkSettings) -> Result<Box<dyn Port>>;
}

/// Byte-oriented packet parser fed by the application-mode consumer.
pub trait ByteSink: Send {
    fn feed_byte(&mut self, byte: u8);
    /// Periodic tick, called whenever the event queue is idle.
    fn service(&mut self) {}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UartEvent {
    /// `n` bytes were appended to the RX ring.
    Data(usize),
    FifoOverflow,
    BufferFull,
    Parity,
    Frame,
}

type RxRing = Arc<Mutex<VecDeque<u8>>>;

struct ApplicationLink {
    writer: Box<dyn Port>,
    stop: Arc<AtomicBool>,
    driver: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

impl ApplicationLink {
    /// Consumer first, so it never observes a queue whose driver is gone.
    fn shutdown(self) {
        self.stop.store(true, Ordering::Release);
        if self.consumer.join().is_err() {
            log::error!("Serial consumer task panicked");
        }
        if self.driver.join().is_err() {
            log::error!("Serial driver task panicked");
        }
        drop(self.writer);
    }
}

enum State {
    Uninitialized,
    Bootloader(Box<dyn Port>),
    Application(ApplicationLink),
}

pub struct SerialTransport {
    opener: Box<dyn PortOpener>,
    config: SerialConfig,
    state: State,
    live_consumers: Arc<AtomicUsize>,
}

impl SerialTransport {
    pub fn new(opener: impl PortOpener + 'static, config: SerialConfig) -> Self {
        SerialTransport {
            opener: Box::new(opener),
            config,
            state: State::Uninitialized,
            live_consumers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn shared(self) -> SharedTransport {
        Arc::new(Mutex::new(self))
    }

    pub fn mode(&self) -> Option<LinkMode> {
        match self.state {
            State::Uninitialized => None,
            State::Bootloader(_) => Some(LinkMode::Bootloader),
            State::Application(_) => Some(LinkMode::Application),
        }
    }

    /// Number of application consumer tasks still running.
    pub fn live_consumers(&self) -> usize {
        self.live_consumers.load(Ordering::Acquire)
    }

    /// Tears down whatever owns the peripheral, then brings it up in `mode`.
    ///
    /// Application mode requires a consumer; bootloader mode ignores it.
    pub fn start(&mut self, mode: LinkMode, consumer: Option<Box<dyn ByteSink>>) -> Result<()> {
        self.stop();

        match mode {
            LinkMode::Bootloader => {
                let settings = LinkSettings {
                    baud: self.config.bootloader_baud,
                    read_timeout: self.config.read_timeout(),
                };
                let port = self.opener.open(&settings)?;
                log::info!("Serial link in bootloader mode @ {} baud, 8E1", settings.baud);
                self.state = State::Bootloader(port);
            }
            LinkMode::Application => {
                let Some(sink) = consumer else {
                    anyhow::bail!("application mode requires a byte consumer");
                };
                let settings = LinkSettings {
                    baud: self.config.application_baud,
                    read_timeout: self.config.read_timeout(),
                };
                let writer = self.opener.open(&settings)?;
                let reader = writer.try_clone()?;
                self.state = State::Application(self.spawn_application(writer, reader, sink)?);
                log::info!("Serial link in application mode @ {} baud, 8E1", settings.baud);
            }
        }
        Ok(())
    }

    fn spawn_application(
        &self,
        writer: Box<dyn Port>,
        reader: Box<dyn Port>,
        sink: Box<dyn ByteSink>,
    ) -> Result<ApplicationLink> {
        let stop = Arc::new(AtomicBool::new(false));
        let ring: RxRing = Arc::new(Mutex::new(VecDeque::with_capacity(RX_BUFFER_SIZE)));
        let (events_tx, events_rx) = bounded(EVENT_QUEUE_DEPTH);
        let poll = self.config.read_timeout();

        let driver = {
            let stop = stop.clone();
            let ring = ring.clone();
            thread::Builder::new()
                .name("uart-driver".to_string())
                .spawn(move || run_driver(reader, ring, events_tx, stop, poll))?
        };

        self.live_consumers.fetch_add(1, Ordering::AcqRel);
        let live = ConsumerCount(self.live_consumers.clone());
        let consumer = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("uart-consumer".to_string())
                .spawn(move || {
                    let _live = live;
                    run_consumer(events_rx, ring, sink, stop, poll)
                })
        };
        let consumer = match consumer {
            Ok(handle) => handle,
            Err(e) => {
                stop.store(true, Ordering::Release);
                let _ = driver.join();
                return Err(e.into());
            }
        };

        Ok(ApplicationLink {
            writer,
            stop,
            driver,
            consumer,
        })
    }

    /// Stops background tasks and releases the peripheral.
    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, State::Uninitialized) {
            State::Uninitialized => {}
            State::Bootloader(port) => {
                log::debug!("Closing bootloader serial link");
                drop(port);
            }
            State::Application(link) => {
                log::debug!("Stopping application serial tasks");
                link.shutdown();
            }
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn Port>> {
        match &mut self.state {
            State::Uninitialized => anyhow::bail!("serial link not started"),
            State::Bootloader(port) => Ok(port),
            State::Application(link) => Ok(&mut link.writer),
        }
    }

    /// Sends `bytes` in DMA-sized pieces, pausing between pieces.
    pub fn transmit(&mut self, bytes: &[u8]) -> Result<usize> {
        let delay = self.config.inter_chunk_delay();
        let port = self.port()?;
        let mut sent = 0;
        for (i, chunk) in bytes.chunks(MAX_DMA_TRANSFER).enumerate() {
            if i > 0 {
                thread::sleep(delay);
            }
            port.write_all(chunk)?;
            sent += chunk.len();
        }
        Ok(sent)
    }

    /// Blocking read of exactly `buf.len()` bytes. Bootloader mode only.
    pub fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let State::Bootloader(port) = &mut self.state else {
            anyhow::bail!("blocking receive requires bootloader mode");
        };
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            match port.read(&mut buf[filled..]) {
                Ok(n) => filled += n,
                Err(e) if is_idle(&e) => {}
                Err(e) => return Err(e.into()),
            }
            if filled < buf.len() && Instant::now() >= deadline {
                anyhow::bail!(
                    "serial receive timed out after {:?} ({} of {} bytes)",
                    timeout,
                    filled,
                    buf.len()
                );
            }
        }
        Ok(())
    }

    pub fn clear_input(&mut self) -> Result<()> {
        self.port()?.clear_input()
    }

    pub fn set_control_line(&mut self, line: ControlLine, level: bool) -> Result<()> {
        self.port()?.set_control_line(line, level)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ConsumerCount(Arc<AtomicUsize>);

impl Drop for ConsumerCount {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn run_driver(
    mut port: Box<dyn Port>,
    ring: RxRing,
    events: Sender<UartEvent>,
    stop: Arc<AtomicBool>,
    poll: Duration,
) {
    let mut buf = [0u8; 256];
    let mut overflowed = false;

    while !stop.load(Ordering::Acquire) {
        if overflowed {
            match events.try_send(UartEvent::FifoOverflow) {
                Ok(()) => overflowed = false,
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => break,
            }
        }

        let event = match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                let mut rx = ring.lock();
                if rx.len() + n > RX_BUFFER_SIZE {
                    UartEvent::BufferFull
                } else {
                    rx.extend(&buf[..n]);
                    UartEvent::Data(n)
                }
            }
            Err(e) if is_idle(&e) => continue,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => UartEvent::Frame,
            Err(e) => {
                log::warn!("UART read error: {}", e);
                thread::sleep(poll);
                continue;
            }
        };

        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => overflowed = true,
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
}

fn run_consumer(
    events: Receiver<UartEvent>,
    ring: RxRing,
    mut sink: Box<dyn ByteSink>,
    stop: Arc<AtomicBool>,
    poll: Duration,
) {
    let mut pending = Vec::with_capacity(RX_BUFFER_SIZE);
    while !stop.load(Ordering::Acquire) {
        match events.recv_timeout(poll) {
            // Event lengths go stale across an overflow flush; feed the whole ring.
            Ok(UartEvent::Data(_)) => {
                pending.extend(ring.lock().drain(..));
                for byte in pending.drain(..) {
                    sink.feed_byte(byte);
                }
            }
            Ok(event @ (UartEvent::FifoOverflow | UartEvent::BufferFull)) => {
                log::warn!("UART {:?}, dropping buffered input", event);
                let mut rx = ring.lock();
                rx.clear();
                while events.try_recv().is_ok() {}
            }
            Ok(UartEvent::Parity) => log::warn!("UART parity error"),
            Ok(UartEvent::Frame) => log::warn!("UART frame error"),
            Err(RecvTimeoutError::Timeout) => sink.service(),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ScriptedOpener, Wire};
    use super::*;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<u8>>>);

    impl ByteSink for Collect {
        fn feed_byte(&mut self, byte: u8) {
            self.0.lock().push(byte);
        }
    }

    fn transport(wire: &Wire) -> SerialTransport {
        SerialTransport::new(ScriptedOpener::new(wire.clone()), SerialConfig::default())
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn application_to_bootloader_leaves_no_consumer() {
        let wire = Wire::default();
        let mut t = transport(&wire);
        t.start(LinkMode::Application, Some(Box::new(Collect::default())))
            .unwrap();
        assert_eq!(t.live_consumers(), 1);

        t.start(LinkMode::Bootloader, None).unwrap();
        assert_eq!(t.mode(), Some(LinkMode::Bootloader));
        assert_eq!(t.live_consumers(), 0);
    }

    #[test]
    fn restarting_application_never_duplicates_consumer() {
        let wire = Wire::default();
        let mut t = transport(&wire);
        for _ in 0..3 {
            t.start(LinkMode::Application, Some(Box::new(Collect::default())))
                .unwrap();
            assert_eq!(t.live_consumers(), 1);
        }
        t.stop();
        assert_eq!(t.live_consumers(), 0);
        assert_eq!(t.mode(), None);
    }

    #[test]
    fn modes_use_their_own_baud_rates() {
        let wire = Wire::default();
        let mut t = transport(&wire);
        t.start(LinkMode::Bootloader, None).unwrap();
        t.start(LinkMode::Application, Some(Box::new(Collect::default())))
            .unwrap();
        assert_eq!(wire.opened_bauds(), vec![115200, 921600]);
    }

    #[test]
    fn application_mode_requires_consumer() {
        let mut t = transport(&Wire::default());
        assert!(t.start(LinkMode::Application, None).is_err());
        assert_eq!(t.mode(), None);
    }

    #[test]
    fn consumer_feeds_received_bytes_in_order() {
        let wire = Wire::default();
        let sink = Collect::default();
        let mut t = transport(&wire);
        t.start(LinkMode::Application, Some(Box::new(sink.clone())))
            .unwrap();

        wire.push_inbound(&[1, 2, 3, 4, 5]);
        assert!(wait_until(|| sink.0.lock().len() == 5));
        assert_eq!(*sink.0.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn transmit_splits_at_dma_limit() {
        let wire = Wire::default();
        let mut t = transport(&wire);
        t.start(LinkMode::Bootloader, None).unwrap();

        let payload = vec![0x42u8; MAX_DMA_TRANSFER * 2 + 10];
        let sent = t.transmit(&payload).unwrap();
        assert_eq!(sent, payload.len());
        assert_eq!(
            wire.write_sizes(),
            vec![MAX_DMA_TRANSFER, MAX_DMA_TRANSFER, 10]
        );
        assert_eq!(wire.take_outbound(), payload);
    }

    #[test]
    fn transmit_without_link_fails() {
        let mut t = transport(&Wire::default());
        assert!(t.transmit(&[1, 2, 3]).is_err());
    }

    #[test]
    fn receive_times_out_on_short_input() {
        let wire = Wire::default();
        let mut t = transport(&wire);
        t.start(LinkMode::Bootloader, None).unwrap();
        wire.push_inbound(&[0x79]);

        let mut buf = [0u8; 2];
        assert!(t.receive(&mut buf, Duration::from_millis(20)).is_err());
    }

    #[test]
    fn overflow_flushes_ring_and_queue() {
        let (tx, rx) = bounded(4);
        let ring: RxRing = Arc::new(Mutex::new(VecDeque::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let sink = Collect::default();

        ring.lock().extend([9, 9, 9]);
        tx.send(UartEvent::FifoOverflow).unwrap();
        tx.send(UartEvent::Data(3)).unwrap();
        drop(tx);

        run_consumer(
            rx,
            ring.clone(),
            Box::new(sink.clone()),
            stop,
            Duration::from_millis(5),
        );
        assert!(ring.lock().is_empty());
        assert!(sink.0.lock().is_empty());
    }

    #[test]
    fn data_event_feeds_everything_buffered() {
        let (tx, rx) = bounded(4);
        let ring: RxRing = Arc::new(Mutex::new(VecDeque::new()));
        let sink = Collect::default();

        // Two bytes whose event was discarded, then a fresh three-byte burst.
        ring.lock().extend([0xee, 0xee, 0xa5, 0x5a, 0x10]);
        tx.send(UartEvent::Data(3)).unwrap();
        drop(tx);

        run_consumer(
            rx,
            ring.clone(),
            Box::new(sink.clone()),
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(5),
        );
        assert_eq!(*sink.0.lock(), vec![0xee, 0xee, 0xa5, 0x5a, 0x10]);
        assert!(ring.lock().is_empty());
    }

    #[test]
    fn traffic_after_overflow_is_delivered_whole() {
        let (tx, rx) = bounded(4);
        let ring: RxRing = Arc::new(Mutex::new(VecDeque::new()));
        let sink = Collect::default();

        ring.lock().extend([9, 9]);
        tx.send(UartEvent::BufferFull).unwrap();
        let consumer = {
            let ring = ring.clone();
            let sink = sink.clone();
            thread::spawn(move || {
                run_consumer(
                    rx,
                    ring,
                    Box::new(sink),
                    Arc::new(AtomicBool::new(false)),
                    Duration::from_millis(5),
                )
            })
        };
        assert!(wait_until(|| ring.lock().is_empty()));

        // A reply arriving in two bursts must reach the sink in full.
        ring.lock().extend([0xa5, 0x5a]);
        tx.send(UartEvent::Data(2)).unwrap();
        ring.lock().extend([0x10, 0x00]);
        tx.send(UartEvent::Data(2)).unwrap();
        assert!(wait_until(|| sink.0.lock().len() == 4));
        drop(tx);
        consumer.join().unwrap();

        assert_eq!(*sink.0.lock(), vec![0xa5, 0x5a, 0x10, 0x00]);
        assert!(ring.lock().is_empty());
    }

    #[test]
    fn line_errors_are_not_fatal() {
        let (tx, rx) = bounded(4);
        let ring: RxRing = Arc::new(Mutex::new(VecDeque::new()));
        let sink = Collect::default();

        tx.send(UartEvent::Parity).unwrap();
        tx.send(UartEvent::Frame).unwrap();
        ring.lock().extend([7, 8]);
        tx.send(UartEvent::Data(2)).unwrap();
        drop(tx);

        run_consumer(
            rx,
            ring,
            Box::new(sink.clone()),
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(5),
        );
        assert_eq!(*sink.0.lock(), vec![7, 8]);
    }
}
