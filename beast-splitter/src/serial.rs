//! Serial transport with baud-rate autodetection.
//!
//! With no fixed rate the port is probed through the standard rates; a rate
//! is locked once enough consecutive messages frame cleanly, and unlocked
//! again if the line later produces a long run of unframeable bytes. Reads
//! that come back mostly empty are rescheduled after a short delay so a
//! trickle of input does not spin the event loop.

use std::io;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::time::{self, Instant};
use tokio_serial::{DataBits, FlowControl, Parity, SerialStream, StopBits};
use tracing::{info, warn};

use beast_core::{Settings, TriState};

use crate::receiver::{FramingAction, Transport, READ_BUFFER_SIZE};

// The standard baud rates to try, in their preferred order.
const AUTOBAUD_STANDARD_RATES: [u32; 2] = [3_000_000, 1_000_000];

// The initial interval to wait for good messages before changing rates.
const AUTOBAUD_BASE_INTERVAL: Duration = Duration::from_millis(1000);

// The maximum interval between changing baud rates.
const AUTOBAUD_MAX_INTERVAL: Duration = Duration::from_millis(16_000);

// Consecutive good messages needed before the baud rate is locked.
const AUTOBAUD_GOOD_MESSAGES: u32 = 4;

// Bytes without good sync before restarting autobauding.
const AUTOBAUD_RESTART_BYTES: u32 = 1000;

// How long to wait between scheduling reads on a trickling line.
const READ_INTERVAL: Duration = Duration::from_millis(50);

pub struct SerialTransport {
    path: String,
    port: Option<SerialStream>,
    autobauding: bool,
    autobaud_rates: Vec<u32>, // empty if a fixed rate was given
    rate_index: usize,
    baud_rate: u32,
    autobaud_interval: Duration,
    autobaud_deadline: Option<Instant>,
    next_read_at: Option<Instant>,
    warned_about_rate: bool,
}

impl SerialTransport {
    pub fn new(path: String, fixed_baud_rate: u32) -> SerialTransport {
        let (autobauding, autobaud_rates, baud_rate) = if fixed_baud_rate == 0 {
            let rates = AUTOBAUD_STANDARD_RATES.to_vec();
            let first = rates[0];
            (true, rates, first)
        } else {
            (false, Vec::new(), fixed_baud_rate)
        };

        SerialTransport {
            path,
            port: None,
            autobauding,
            autobaud_rates,
            rate_index: 0,
            baud_rate,
            autobaud_interval: AUTOBAUD_BASE_INTERVAL,
            autobaud_deadline: None,
            next_read_at: None,
            warned_about_rate: false,
        }
    }

    fn open_port(&mut self) -> io::Result<()> {
        info!("{}: opening port at {} bps", self.what(), self.baud_rate);

        let builder = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::Hardware);
        let stream =
            SerialStream::open(&builder).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.port = Some(stream);
        Ok(())
    }

    fn advance_autobaud(&mut self) -> io::Result<()> {
        if !self.autobauding {
            return Ok(());
        }

        self.rate_index += 1;
        if self.rate_index >= self.autobaud_rates.len() {
            // Ran out of rates to try. Increase the interval and start again.
            warn!(
                "{}: autobaud failed, trying again (consider specifying --fixed-baud)",
                self.what()
            );
            self.rate_index = 0;
            self.autobaud_interval = (self.autobaud_interval * 2).min(AUTOBAUD_MAX_INTERVAL);
        }
        self.baud_rate = self.autobaud_rates[self.rate_index];

        self.open_port()?;
        self.autobaud_deadline = Some(Instant::now() + self.autobaud_interval);
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn what(&self) -> String {
        format!("serial({})", self.path)
    }

    async fn try_to_connect(&mut self) -> io::Result<()> {
        self.open_port()?;
        if self.autobauding && self.autobaud_rates.len() > 1 {
            self.autobaud_deadline = Some(Instant::now() + self.autobaud_interval);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.port = None;
        self.autobaud_deadline = None;
        self.next_read_at = None;

        // Probing restarts from scratch on the next connection attempt.
        if !self.autobaud_rates.is_empty() {
            self.autobauding = true;
            self.autobaud_interval = AUTOBAUD_BASE_INTERVAL;
            self.rate_index = 0;
            self.baud_rate = self.autobaud_rates[0];
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(at) = self.next_read_at.take() {
            time::sleep_until(at).await;
        }

        let port = self
            .port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port not open"))?;
        let n = port.read(buf).await?;

        // A mostly-empty read means the line is trickling; don't spin.
        if n < READ_BUFFER_SIZE * 3 / 4 {
            self.next_read_at = Some(Instant::now() + READ_INTERVAL);
        }
        Ok(n)
    }

    async fn low_level_write(&mut self, message: &[u8]) -> io::Result<bool> {
        let Some(port) = self.port.as_mut() else {
            return Ok(false);
        };
        port.write_all(message).await?;
        Ok(true)
    }

    fn apply_connection_settings(&self, settings: &mut Settings) {
        // The port is opened with hardware flow control; tell the receiver.
        settings.rts_handshake = TriState::ON;
    }

    fn note_good_message(&mut self, good_messages: u32) {
        if self.autobauding && good_messages >= AUTOBAUD_GOOD_MESSAGES {
            info!("{}: autobaud selected {} bps", self.what(), self.baud_rate);
            self.autobauding = false;
            self.autobaud_deadline = None;
        }
    }

    fn check_framing(&mut self, good_sync: bool, bad_bytes: u32) -> io::Result<FramingAction> {
        if self.autobauding || good_sync || bad_bytes <= AUTOBAUD_RESTART_BYTES {
            return Ok(FramingAction::Continue);
        }

        if !self.autobaud_rates.is_empty() {
            // We picked a rate but it's not really working any more.
            warn!(
                "{}: too many framing errors seen, restarting autobauding",
                self.what()
            );
            self.autobauding = true;
            self.advance_autobaud()?;
            Ok(FramingAction::ResetFramer)
        } else {
            if !self.warned_about_rate {
                warn!(
                    "{}: many framing errors seen, is the baud rate ({} bps) correct?",
                    self.what(),
                    self.baud_rate
                );
                self.warned_about_rate = true;
            }
            Ok(FramingAction::Continue)
        }
    }

    fn suppress_dispatch(&self) -> bool {
        self.autobauding
    }

    fn deadline(&self) -> Option<Instant> {
        self.autobaud_deadline
    }

    fn on_deadline(&mut self) -> io::Result<FramingAction> {
        self.autobaud_deadline = None;
        self.advance_autobaud()?;
        Ok(FramingAction::ResetFramer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
