//! The decoded Beast message value.
//!
//! A `Message` is created once by the framer and then passed by reference to
//! every downstream sink; it is never mutated. CRC residual and single-bit
//! correction are computed on first use and cached.

use std::cell::Cell;
use std::fmt;

use crate::crc;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// The five Beast frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ModeAC,
    ModeSShort,
    ModeSLong,
    Status,
    Position,
}

impl MessageKind {
    /// Map a wire type byte to a kind. `None` for anything unrecognized.
    pub fn from_byte(b: u8) -> Option<MessageKind> {
        match b {
            0x31 => Some(MessageKind::ModeAC),
            0x32 => Some(MessageKind::ModeSShort),
            0x33 => Some(MessageKind::ModeSLong),
            0x34 => Some(MessageKind::Status),
            0x35 => Some(MessageKind::Position),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            MessageKind::ModeAC => 0x31,
            MessageKind::ModeSShort => 0x32,
            MessageKind::ModeSLong => 0x33,
            MessageKind::Status => 0x34,
            MessageKind::Position => 0x35,
        }
    }

    /// Expected payload length for a message of this kind.
    ///
    /// Position frames promote the 7 metadata bytes into the payload, so
    /// their stored payload is 7 + 14 bytes.
    pub fn payload_length(self) -> usize {
        match self {
            MessageKind::ModeAC => 2,
            MessageKind::ModeSShort => 7,
            MessageKind::ModeSLong => 14,
            MessageKind::Status => 14,
            MessageKind::Position => 21,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::ModeAC => write!(f, "MODE_AC"),
            MessageKind::ModeSShort => write!(f, "MODE_S_SHORT"),
            MessageKind::ModeSLong => write!(f, "MODE_S_LONG"),
            MessageKind::Status => write!(f, "STATUS"),
            MessageKind::Position => write!(f, "POSITION"),
        }
    }
}

/// Which clock domain a message timestamp was produced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampDomain {
    #[default]
    Unknown,
    TwelveMHz,
    Gps,
}

// ---------------------------------------------------------------------------
// Timestamp conversion
// ---------------------------------------------------------------------------

/// GPS timestamps pack seconds-of-day into the high bits and nanoseconds
/// into the low 30.
pub const GPS_NANOS_MASK: u64 = (1 << 30) - 1;

/// Scale a 12 MHz tick count up to a GPS-style timestamp.
pub fn twelve_mhz_to_gps(ts: u64) -> u64 {
    let ns = ts * 1000 / 12;
    let seconds = (ns / 1_000_000_000) % 86_400;
    let nanos = ns % 1_000_000_000;
    (seconds << 30) | nanos
}

/// Scale a GPS-style timestamp down to 12 MHz ticks.
pub fn gps_to_twelve_mhz(ts: u64) -> u64 {
    let ns = (ts >> 30) * 1_000_000_000 + (ts & GPS_NANOS_MASK);
    ns * 12 / 1000
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

// Cached correction state; Unknown until the syndrome lookup has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Correction {
    Unknown,
    NotCorrectable,
    Bit(u32),
}

// Residual cache sentinel. Real residuals mask to 24 bits, so this value
// can never collide with a computed one.
const RESIDUAL_UNSET: u32 = 0xFFFF_FFFF;

/// A single deframed Beast message.
#[derive(Debug, Clone)]
pub struct Message {
    kind: MessageKind,
    timestamp_domain: TimestampDomain,
    timestamp: u64,
    signal: u8,
    payload: Vec<u8>,
    residual: Cell<u32>,
    correction: Cell<Correction>,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        timestamp_domain: TimestampDomain,
        timestamp: u64,
        signal: u8,
        payload: Vec<u8>,
    ) -> Message {
        debug_assert_eq!(payload.len(), kind.payload_length());
        Message {
            kind,
            timestamp_domain,
            timestamp,
            signal,
            payload,
            residual: Cell::new(RESIDUAL_UNSET),
            correction: Cell::new(Correction::Unknown),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn timestamp_domain(&self) -> TimestampDomain {
        self.timestamp_domain
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn signal(&self) -> u8 {
        self.signal
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Downlink format: the top 5 bits of the first payload byte. Only
    /// meaningful for Mode S messages.
    pub fn df(&self) -> Option<u8> {
        match self.kind {
            MessageKind::ModeSShort | MessageKind::ModeSLong => {
                Some((self.payload[0] >> 3) & 0x1F)
            }
            _ => None,
        }
    }

    /// CRC residual of the payload, computed once and cached.
    pub fn residual(&self) -> u32 {
        let mut r = self.residual.get();
        if r == RESIDUAL_UNSET {
            r = crc::message_residual(&self.payload);
            self.residual.set(r);
        }
        r
    }

    /// CRC verdict by downlink format.
    ///
    /// DF11 replies overlay the interrogator ID on the low 7 residual bits,
    /// which are masked off before the test. DF17/18 must have a clean
    /// residual. Every other DF XORs the ICAO address into the trailer and
    /// cannot be judged here, so it is never "bad".
    pub fn crc_bad(&self) -> bool {
        match self.df() {
            Some(11) => (self.residual() & 0xFFFF80) != 0,
            Some(17) | Some(18) => self.residual() != 0,
            _ => false,
        }
    }

    /// If the residual corresponds to a single-bit error, the position of
    /// that bit. Cached after the first lookup.
    pub fn correctable_bit(&self) -> Option<u32> {
        match self.correction.get() {
            Correction::Bit(bit) => return Some(bit),
            Correction::NotCorrectable => return None,
            Correction::Unknown => {}
        }
        let found = match self.kind {
            MessageKind::ModeSShort | MessageKind::ModeSLong => {
                crc::correctable_bit(self.residual(), self.payload.len())
            }
            _ => None,
        };
        self.correction.set(match found {
            Some(bit) => Correction::Bit(bit),
            None => Correction::NotCorrectable,
        });
        found
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
