//! Receiver-side connection management.
//!
//! The `Receiver` owns the shared upstream logic: framing, receiver-type
//! autodetection, settings negotiation with resend suppression, Radarcape
//! liveness, reconnects, and dispatch gating. Everything transport-specific
//! (serial vs TCP, autobaud, read throttling) sits behind the `Transport`
//! trait.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use beast_core::{
    Filter, FilterDistributor, Framer, Message, MessageKind, Settings, TimestampDomain, TriState,
};

/// How long to wait before re-trying a failed connection.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(60);

/// How long to wait for a Radarcape status message before concluding the
/// receiver is a classic Beast.
const RADARCAPE_DETECT_INTERVAL: Duration = Duration::from_secs(3);

/// A Radarcape emits status messages about once a second; if none arrive
/// for this long the connection is considered dead.
const RADARCAPE_LIVENESS_INTERVAL: Duration = Duration::from_secs(15);

/// How many bytes to try to read at a time from the connection.
pub const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiverType {
    #[default]
    Unknown,
    Beast,
    Radarcape,
}

// ---------------------------------------------------------------------------
// Shared receiver state
// ---------------------------------------------------------------------------

/// Connection state shared with the status writer and client sessions.
#[derive(Default)]
pub struct ReceiverState {
    connected: Cell<bool>,
    receiver_type: Cell<ReceiverType>,
}

pub type SharedReceiverState = Rc<ReceiverState>;

impl ReceiverState {
    pub fn connected(&self) -> bool {
        self.connected.get()
    }

    pub fn receiver_type(&self) -> ReceiverType {
        self.receiver_type.get()
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// What the controller asks of a framing-telemetry check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingAction {
    Continue,
    /// The transport reconfigured itself (autobaud rate change); parsing
    /// must restart at a frame boundary.
    ResetFramer,
}

/// The transport-specific face of a receiver connection.
#[allow(async_fn_in_trait)] // single-threaded crate, nothing needs Send bounds
pub trait Transport {
    /// Human label for log messages.
    fn what(&self) -> String;

    /// Establish the connection: resolve, open, configure.
    async fn try_to_connect(&mut self) -> io::Result<()>;

    /// Tear the connection down and reset transport-local probing state.
    fn disconnect(&mut self);

    /// Read some bytes. `Ok(0)` means the peer closed the connection.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Queue a write. `Ok(false)` means there is no connection to accept
    /// it; the bytes are dropped.
    async fn low_level_write(&mut self, message: &[u8]) -> io::Result<bool>;

    /// Transport-specific overrides on the outgoing settings.
    fn apply_connection_settings(&self, settings: &mut Settings);

    /// Consecutive good-message count changed; a serial transport locks
    /// its autobaud rate here.
    fn note_good_message(&mut self, good_messages: u32);

    /// Inspect framing telemetry after a read; may warn or reconfigure.
    fn check_framing(&mut self, good_sync: bool, bad_bytes: u32) -> io::Result<FramingAction>;

    /// While true, decoded messages are not forwarded downstream.
    fn suppress_dispatch(&self) -> bool {
        false
    }

    /// Transport-owned timer (the autobaud timer), if armed.
    fn deadline(&self) -> Option<Instant> {
        None
    }

    /// The armed deadline fired.
    fn on_deadline(&mut self) -> io::Result<FramingAction> {
        Ok(FramingAction::Continue)
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

enum Event {
    FilterChanged(Filter),
    Read(usize),
    AutodetectExpired,
    LivenessExpired,
    TransportTimer,
}

// Await a deadline, or park forever when none is armed.
async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// The shared receiver controller, generic over its transport.
pub struct Receiver<T: Transport> {
    transport: T,
    fixed_settings: Settings,
    fixed_receiver_type: ReceiverType,
    receiver_type: ReceiverType,
    state: SharedReceiverState,
    distributor: Rc<RefCell<FilterDistributor>>,
    filter_rx: mpsc::UnboundedReceiver<Filter>,
    framer: Framer,
    upstream_filter: Filter,
    last_settings_message: Option<Vec<u8>>,
    autodetect_deadline: Option<Instant>,
    liveness_deadline: Option<Instant>,
}

impl<T: Transport> Receiver<T> {
    pub fn new(
        transport: T,
        fixed_settings: Settings,
        state: SharedReceiverState,
        distributor: Rc<RefCell<FilterDistributor>>,
        filter_rx: mpsc::UnboundedReceiver<Filter>,
    ) -> Receiver<T> {
        let fixed_receiver_type = fixed_receiver_type(&fixed_settings);
        Receiver {
            transport,
            fixed_settings,
            fixed_receiver_type,
            receiver_type: fixed_receiver_type,
            state,
            distributor,
            filter_rx,
            framer: Framer::new(),
            upstream_filter: Filter::default(),
            last_settings_message: None,
            autodetect_deadline: None,
            liveness_deadline: None,
        }
    }

    /// Connect, process, reconnect — forever.
    pub async fn run(mut self) {
        loop {
            match self.transport.try_to_connect().await {
                Ok(()) => {
                    self.on_connected();
                    match self.connection_loop().await {
                        Ok(()) => return, // all upstream users gone
                        Err(e) => warn!("{}: i/o error: {e}", self.transport.what()),
                    }
                }
                Err(e) => warn!("{}: connection failed: {e}", self.transport.what()),
            }

            self.transport.disconnect();
            self.state.connected.set(false);
            self.state.receiver_type.set(self.fixed_receiver_type);
            time::sleep(RECONNECT_INTERVAL).await;
        }
    }

    fn on_connected(&mut self) {
        self.state.connected.set(true);
        self.framer.reset();
        self.last_settings_message = None;
        self.set_receiver_type(self.fixed_receiver_type);
        if self.receiver_type == ReceiverType::Unknown {
            self.autodetect_deadline = Some(Instant::now() + RADARCAPE_DETECT_INTERVAL);
        }
    }

    async fn connection_loop(&mut self) -> io::Result<()> {
        let mut readbuf = vec![0u8; READ_BUFFER_SIZE];
        let mut messages: Vec<Message> = Vec::new();

        // Catch up on filter changes that arrived while disconnected, then
        // program the device.
        while let Ok(filter) = self.filter_rx.try_recv() {
            self.upstream_filter = filter;
        }
        self.send_settings().await?;

        loop {
            let event = {
                let autodetect = deadline_sleep(self.autodetect_deadline);
                let liveness = deadline_sleep(self.liveness_deadline);
                let transport_timer = deadline_sleep(self.transport.deadline());
                tokio::select! {
                    // A settings change from a client must reprogram the
                    // device before any further messages are broadcast.
                    biased;
                    changed = self.filter_rx.recv() => match changed {
                        Some(filter) => Event::FilterChanged(filter),
                        None => return Ok(()),
                    },
                    _ = autodetect => Event::AutodetectExpired,
                    _ = liveness => Event::LivenessExpired,
                    _ = transport_timer => Event::TransportTimer,
                    n = self.transport.read(&mut readbuf) => Event::Read(n?),
                }
            };

            match event {
                Event::FilterChanged(filter) => {
                    if filter != self.upstream_filter {
                        self.upstream_filter = filter;
                        self.send_settings().await?;
                    }
                }
                Event::Read(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ));
                }
                Event::Read(n) => {
                    self.handle_input(&readbuf[..n], &mut messages).await?;
                }
                Event::AutodetectExpired => {
                    self.autodetect_deadline = None;
                    info!(
                        "{}: no status message seen, treating receiver as a Beast",
                        self.transport.what()
                    );
                    self.set_receiver_type(ReceiverType::Beast);
                    self.send_settings().await?;
                }
                Event::LivenessExpired => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no status message received from Radarcape",
                    ));
                }
                Event::TransportTimer => {
                    if self.transport.on_deadline()? == FramingAction::ResetFramer {
                        self.framer.reset();
                    }
                }
            }
        }
    }

    async fn handle_input(&mut self, data: &[u8], messages: &mut Vec<Message>) -> io::Result<()> {
        messages.clear();
        self.framer.feed(data, messages);

        if !messages.is_empty() {
            self.transport.note_good_message(self.framer.good_messages());
        }
        let action = self
            .transport
            .check_framing(self.framer.good_sync(), self.framer.bad_bytes())?;
        if action == FramingAction::ResetFramer {
            self.framer.reset();
            messages.clear();
            return Ok(());
        }

        if self.transport.suppress_dispatch() {
            // Not yet convinced of the line rate; nothing goes downstream.
            messages.clear();
            return Ok(());
        }

        for message in messages.drain(..) {
            self.handle_message(message).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: Message) -> io::Result<()> {
        if message.kind() == MessageKind::Status {
            if self.receiver_type == ReceiverType::Unknown {
                info!(
                    "{}: status message seen, receiver is a Radarcape",
                    self.transport.what()
                );
                self.set_receiver_type(ReceiverType::Radarcape);
                // The g/G setting changes meaning with the receiver type.
                self.send_settings().await?;
            }
            if self.receiver_type == ReceiverType::Radarcape {
                self.liveness_deadline = Some(Instant::now() + RADARCAPE_LIVENESS_INTERVAL);
                let gps = message.payload()[0] & 0x10 != 0;
                self.framer.set_timestamp_domain(if gps {
                    TimestampDomain::Gps
                } else {
                    TimestampDomain::TwelveMHz
                });
            }
        }

        if self.receiver_type == ReceiverType::Unknown {
            return Ok(());
        }
        self.distributor.borrow_mut().broadcast(&message);
        Ok(())
    }

    fn set_receiver_type(&mut self, receiver_type: ReceiverType) {
        self.receiver_type = receiver_type;
        self.state.receiver_type.set(receiver_type);
        match receiver_type {
            ReceiverType::Unknown => {
                self.framer.set_timestamp_domain(TimestampDomain::Unknown);
                self.liveness_deadline = None;
            }
            ReceiverType::Beast => {
                self.framer.set_timestamp_domain(TimestampDomain::TwelveMHz);
                self.autodetect_deadline = None;
                self.liveness_deadline = None;
            }
            ReceiverType::Radarcape => {
                // 12MHz until a status message says otherwise.
                self.framer.set_timestamp_domain(TimestampDomain::TwelveMHz);
                self.autodetect_deadline = None;
                self.liveness_deadline = Some(Instant::now() + RADARCAPE_LIVENESS_INTERVAL);
            }
        }
    }

    async fn send_settings(&mut self) -> io::Result<()> {
        let mut settings = materialize_settings(
            &self.fixed_settings,
            &self.upstream_filter,
            self.receiver_type,
        );
        self.transport.apply_connection_settings(&mut settings);

        let message = settings.to_message();
        if self.last_settings_message.as_ref() == Some(&message) {
            return Ok(());
        }

        debug!("{}: sending settings [{settings}]", self.transport.what());
        self.transport.low_level_write(&message).await?;
        self.last_settings_message = Some(message);
        Ok(())
    }
}

/// The settings actually sent upstream: fixed overrides win over what the
/// client union asks for; binary framing is non-negotiable; the radarcape
/// field mirrors the (possibly still unknown) detected type.
fn materialize_settings(
    fixed: &Settings,
    upstream_filter: &Filter,
    receiver_type: ReceiverType,
) -> Settings {
    let mut settings = *fixed | Settings::from_filter(upstream_filter);
    settings.binary_format = TriState::ON;
    settings.radarcape = match receiver_type {
        ReceiverType::Unknown => TriState::DONTCARE,
        ReceiverType::Beast => TriState::OFF,
        ReceiverType::Radarcape => TriState::ON,
    };
    settings
}

fn fixed_receiver_type(fixed_settings: &Settings) -> ReceiverType {
    if fixed_settings.radarcape.is_on() {
        ReceiverType::Radarcape
    } else if fixed_settings.radarcape.is_off() {
        ReceiverType::Beast
    } else {
        ReceiverType::Unknown
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn df_filter(dfs: &[usize]) -> Filter {
        let mut f = Filter::default();
        for &df in dfs {
            f.receive_df[df] = true;
        }
        f
    }

    #[test]
    fn test_fixed_receiver_type_from_settings() {
        assert_eq!(
            fixed_receiver_type(&"R".parse().unwrap()),
            ReceiverType::Radarcape
        );
        assert_eq!(fixed_receiver_type(&"r".parse().unwrap()), ReceiverType::Beast);
        assert_eq!(
            fixed_receiver_type(&Settings::default()),
            ReceiverType::Unknown
        );
    }

    #[test]
    fn test_materialized_settings_force_binary() {
        let s = materialize_settings(&Settings::default(), &Filter::default(), ReceiverType::Beast);
        assert!(s.binary_format.is_on());
    }

    #[test]
    fn test_materialized_settings_infer_radarcape() {
        let fixed = Settings::default();
        let filter = Filter::default();
        assert!(materialize_settings(&fixed, &filter, ReceiverType::Unknown)
            .radarcape
            .is_dontcare());
        assert!(materialize_settings(&fixed, &filter, ReceiverType::Beast)
            .radarcape
            .is_off());
        assert!(materialize_settings(&fixed, &filter, ReceiverType::Radarcape)
            .radarcape
            .is_on());
    }

    #[test]
    fn test_fixed_settings_override_filter() {
        // The union asks for bad CRC, but --force says no.
        let fixed: Settings = "f".parse().unwrap();
        let mut filter = df_filter(&[17]);
        filter.receive_bad_crc = true;
        let s = materialize_settings(&fixed, &filter, ReceiverType::Beast);
        assert!(s.crc_disable.is_off());
    }

    #[test]
    fn test_settings_message_changes_with_receiver_type() {
        // DF0/4/5 unwanted: g/G is emitted for a Beast, and means GPS
        // timestamps instead on a Radarcape.
        let mut filter = df_filter(&[11, 17, 18]);
        filter.receive_gps_timestamps = false;
        let fixed = Settings::default();

        let unknown = materialize_settings(&fixed, &filter, ReceiverType::Unknown).to_message();
        let beast = materialize_settings(&fixed, &filter, ReceiverType::Beast).to_message();
        assert_ne!(unknown, beast);
    }
}
