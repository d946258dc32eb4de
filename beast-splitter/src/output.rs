//! Downstream client sessions.
//!
//! Each connected client (accepted via `--listen` or dialed via
//! `--connect`) owns its negotiated settings, a command parser for inbound
//! `1A 31 X` option bytes, and a coalescing output buffer. Messages are
//! re-encoded per client: binary / AVR / AVR-MLAT framing, timestamp
//! conversion between the wire clock and the client's preferred clock,
//! status-byte substitution, and optional single-bit FEC repair.

use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, info, warn};

use beast_core::{
    message, FilterDistributor, Handle, Message, MessageKind, Settings, TimestampDomain,
};

use crate::receiver::{ReceiverType, SharedReceiverState, RECONNECT_INTERVAL};

const COMMAND_BUFFER_SIZE: usize = 512;

// ---------------------------------------------------------------------------
// Per-message encoding
// ---------------------------------------------------------------------------

fn push_escaped(out: &mut Vec<u8>, b: u8) {
    if b == 0x1A {
        out.push(0x1A);
    }
    out.push(b);
}

const HEX_CHARS: &[u8; 16] = b"0123456789ABCDEF";

fn push_hex(out: &mut Vec<u8>, b: u8) {
    out.push(HEX_CHARS[(b >> 4) as usize]);
    out.push(HEX_CHARS[(b & 0x0F) as usize]);
}

/// Beast binary framing. Position frames carry no timestamp or signal of
/// their own; their promoted payload follows the type byte directly.
pub fn encode_binary(kind: MessageKind, timestamp: u64, signal: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 2 * (7 + data.len()));
    out.push(0x1A);
    out.push(kind.to_byte());
    if kind != MessageKind::Position {
        for shift in [40, 32, 24, 16, 8, 0] {
            push_escaped(&mut out, (timestamp >> shift) as u8);
        }
        push_escaped(&mut out, signal);
    }
    for &b in data {
        push_escaped(&mut out, b);
    }
    out
}

/// AVR framing: `*HEX;\n`, no timestamp.
pub fn encode_avr(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + data.len() * 2);
    out.push(b'*');
    for &b in data {
        push_hex(&mut out, b);
    }
    out.push(b';');
    out.push(b'\n');
    out
}

/// AVR-MLAT framing: `@HEXTS HEX;\n` with the 48-bit timestamp leading.
pub fn encode_avrmlat(timestamp: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(15 + data.len() * 2);
    out.push(b'@');
    for shift in [40, 32, 24, 16, 8, 0] {
        push_hex(&mut out, (timestamp >> shift) as u8);
    }
    for &b in data {
        push_hex(&mut out, b);
    }
    out.push(b';');
    out.push(b'\n');
    out
}

/// Pick the outgoing timestamp for a client: convert between the wire
/// clock domain and what the client negotiated. GPS timestamps only exist
/// when the upstream receiver is a Radarcape.
pub fn convert_timestamp(
    settings: &Settings,
    radarcape_upstream: bool,
    domain: TimestampDomain,
    timestamp: u64,
) -> u64 {
    let wants_gps = settings.gps_timestamps.value(true) && radarcape_upstream;
    match (domain, wants_gps) {
        (TimestampDomain::TwelveMHz, true) => message::twelve_mhz_to_gps(timestamp),
        (TimestampDomain::Gps, false) => message::gps_to_twelve_mhz(timestamp),
        _ => timestamp,
    }
}

/// Re-encode one message for a client's negotiated settings. `None` means
/// this message has no representation on this connection.
pub fn encode_for_client(
    settings: &Settings,
    radarcape_upstream: bool,
    message: &Message,
) -> Option<Vec<u8>> {
    let binary = settings.binary_format.value(true);

    // Status and position frames only exist in the binary format.
    if !binary && matches!(message.kind(), MessageKind::Status | MessageKind::Position) {
        return None;
    }

    let mut payload = Cow::Borrowed(message.payload());

    // Single-bit FEC repair, unless the client asked for verbatim data.
    if !settings.verbatim.value(false)
        && matches!(
            message.kind(),
            MessageKind::ModeSShort | MessageKind::ModeSLong
        )
        && message.crc_bad()
    {
        if let Some(bit) = message.correctable_bit() {
            let bit = bit as usize;
            let mut fixed = payload.into_owned();
            fixed[bit / 8] ^= 1 << (7 - (bit & 7));
            payload = Cow::Owned(fixed);
        }
    }

    // Each client sees its own dipswitch byte in status messages.
    if message.kind() == MessageKind::Status {
        let mut copy = payload.into_owned();
        copy[0] = settings.to_status_byte();
        payload = Cow::Owned(copy);
    }

    let timestamp = convert_timestamp(
        settings,
        radarcape_upstream,
        message.timestamp_domain(),
        message.timestamp(),
    );

    Some(if binary {
        encode_binary(message.kind(), timestamp, message.signal(), &payload)
    } else if settings.avrmlat.value(true) {
        encode_avrmlat(timestamp, &payload)
    } else {
        encode_avr(&payload)
    })
}

// ---------------------------------------------------------------------------
// Inbound option commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandState {
    Find1A,
    Read1,
    ReadOption,
}

/// Apply one option letter to a client's settings. Returns false for
/// unrecognized letters, which are silently ignored.
///
/// The g/G letter means GPS timestamps when the upstream receiver is a
/// Radarcape and the DF0/4/5 filter otherwise.
fn apply_option(settings: &mut Settings, option: u8, radarcape_upstream: bool) -> bool {
    let on = option.is_ascii_uppercase();
    let field = match option.to_ascii_lowercase() {
        b'c' => &mut settings.binary_format,
        b'd' => &mut settings.filter_11_17_18,
        b'e' => &mut settings.avrmlat,
        b'f' => &mut settings.crc_disable,
        b'g' => {
            if radarcape_upstream {
                &mut settings.gps_timestamps
            } else {
                &mut settings.filter_0_4_5
            }
        }
        b'h' => &mut settings.rts_handshake,
        b'i' => &mut settings.fec_disable,
        b'j' => &mut settings.modeac_enable,
        b'k' => &mut settings.position_enable,
        b'v' => &mut settings.verbatim,
        _ => return false,
    };
    *field = on.into();
    true
}

// ---------------------------------------------------------------------------
// Client session
// ---------------------------------------------------------------------------

/// One downstream connection: negotiated settings, command parser state,
/// and the coalescing output buffer with its single in-flight flush.
pub struct Client {
    label: String,
    settings: RefCell<Settings>,
    receiver: SharedReceiverState,
    distributor: Rc<RefCell<FilterDistributor>>,
    handle: Cell<Option<Handle>>,
    buffer: RefCell<BytesMut>,
    flush_scheduled: Cell<bool>,
    writer: RefCell<Option<OwnedWriteHalf>>,
    closed: Cell<bool>,
    closed_notify: Notify,
    command_state: Cell<CommandState>,
}

impl Client {
    /// Register a new client on an established socket and start its
    /// command-reader task.
    pub fn start(
        socket: TcpStream,
        settings: Settings,
        label: String,
        distributor: Rc<RefCell<FilterDistributor>>,
        receiver: SharedReceiverState,
    ) -> Rc<Client> {
        let (read_half, write_half) = socket.into_split();
        let client = Rc::new(Client {
            label,
            settings: RefCell::new(settings),
            receiver,
            distributor: distributor.clone(),
            handle: Cell::new(None),
            buffer: RefCell::new(BytesMut::new()),
            flush_scheduled: Cell::new(false),
            writer: RefCell::new(Some(write_half)),
            closed: Cell::new(false),
            closed_notify: Notify::new(),
            command_state: Cell::new(CommandState::Find1A),
        });

        let sink = {
            let client = client.clone();
            move |message: &Message| client.dispatch(message)
        };
        let handle = distributor.borrow_mut().add_client(sink, settings.to_filter());
        client.handle.set(Some(handle));

        tokio::task::spawn_local({
            let client = client.clone();
            async move { client.read_commands(read_half).await }
        });

        client
    }

    /// Resolves once the connection has closed for any reason.
    pub async fn wait_closed(&self) {
        self.closed_notify.notified().await;
    }

    // Distributor sink: encode and queue. Returning false tells the
    // distributor this client is gone.
    fn dispatch(self: &Rc<Self>, message: &Message) -> bool {
        if self.closed.get() {
            return false;
        }
        let settings = *self.settings.borrow();
        let radarcape = self.receiver.receiver_type() == ReceiverType::Radarcape;
        if let Some(bytes) = encode_for_client(&settings, radarcape, message) {
            self.queue_write(&bytes);
        }
        true
    }

    // Append to the output buffer; the first byte queued schedules the
    // flush task. Exactly one flush is in flight at a time.
    fn queue_write(self: &Rc<Self>, bytes: &[u8]) {
        self.buffer.borrow_mut().extend_from_slice(bytes);
        if !self.flush_scheduled.replace(true) {
            let client = self.clone();
            tokio::task::spawn_local(client.flush());
        }
    }

    async fn flush(self: Rc<Self>) {
        loop {
            let chunk = {
                let mut buffer = self.buffer.borrow_mut();
                if buffer.is_empty() {
                    self.flush_scheduled.set(false);
                    return;
                }
                buffer.split()
            };

            // The write half leaves the shared slot while the write is in
            // flight; dispatches keep appending to the buffer meanwhile.
            let taken = self.writer.borrow_mut().take();
            let Some(mut writer) = taken else {
                self.flush_scheduled.set(false);
                return;
            };

            match writer.write_all(&chunk).await {
                Ok(()) => {
                    if self.closed.get() {
                        return;
                    }
                    *self.writer.borrow_mut() = Some(writer);
                }
                Err(e) => {
                    info!("{}: write failed: {e}", self.label);
                    self.flush_scheduled.set(false);
                    self.close();
                    return;
                }
            }
        }
    }

    async fn read_commands(self: Rc<Self>, mut reader: OwnedReadHalf) {
        let mut buf = vec![0u8; COMMAND_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    info!("{}: connection closed by peer", self.label);
                    self.close();
                    return;
                }
                Ok(n) => self.handle_commands(&buf[..n]),
                Err(e) => {
                    info!("{}: read failed: {e}", self.label);
                    self.close();
                    return;
                }
            }
            if self.closed.get() {
                return;
            }
        }
    }

    // Scan an input buffer for 1A 31 X option commands. One filter update
    // is pushed to the distributor per buffer, however many options it
    // contained.
    fn handle_commands(&self, data: &[u8]) {
        let radarcape = self.receiver.receiver_type() == ReceiverType::Radarcape;
        let mut changed = false;
        let mut state = self.command_state.get();
        {
            let mut settings = self.settings.borrow_mut();
            for &b in data {
                state = match state {
                    CommandState::Find1A => {
                        if b == 0x1A {
                            CommandState::Read1
                        } else {
                            CommandState::Find1A
                        }
                    }
                    CommandState::Read1 => {
                        if b == 0x31 {
                            CommandState::ReadOption
                        } else {
                            CommandState::Find1A
                        }
                    }
                    CommandState::ReadOption => {
                        changed |= apply_option(&mut settings, b, radarcape);
                        CommandState::Find1A
                    }
                };
            }
        }
        self.command_state.set(state);

        if changed {
            let settings = self.settings.borrow();
            debug!("{}: settings now [{}]", self.label, *settings);
            let filter = settings.to_filter();
            drop(settings);
            if let Some(handle) = self.handle.get() {
                self.distributor.borrow_mut().update_client_filter(handle, filter);
            }
        }
    }

    /// Tear the session down and deregister from the distributor. Safe to
    /// call more than once.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(handle) = self.handle.get() {
            self.distributor.borrow_mut().remove_client(handle);
        }
        *self.writer.borrow_mut() = None;
        self.closed_notify.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Listener and outbound connections
// ---------------------------------------------------------------------------

/// Accept loop for one bound listener socket.
pub async fn run_listener(
    listener: TcpListener,
    settings: Settings,
    distributor: Rc<RefCell<FilterDistributor>>,
    receiver: SharedReceiverState,
) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                info!("client({peer}): accepted connection");
                Client::start(
                    socket,
                    settings,
                    format!("client({peer})"),
                    distributor.clone(),
                    receiver.clone(),
                );
            }
            Err(e) => {
                warn!("accept failed: {e}");
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Maintain one outbound client connection, redialing after it drops.
pub async fn run_connect(
    host: String,
    port: u16,
    settings: Settings,
    distributor: Rc<RefCell<FilterDistributor>>,
    receiver: SharedReceiverState,
) {
    let label = format!("connect({host}:{port})");
    loop {
        match connect_any(&label, &host, port).await {
            Ok(socket) => {
                info!("{label}: connected");
                let client = Client::start(
                    socket,
                    settings,
                    label.clone(),
                    distributor.clone(),
                    receiver.clone(),
                );
                client.wait_closed().await;
            }
            Err(e) => warn!("{label}: {e}"),
        }
        time::sleep(RECONNECT_INTERVAL).await;
    }
}

async fn connect_any(label: &str, host: &str, port: u16) -> io::Result<TcpStream> {
    let addrs: Vec<_> = lookup_host((host, port)).await?.collect();
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                warn!("{label}: connection to {addr} failed: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
