//! The Beast frame decoder.
//!
//! Wire format: `0x1A, TYPE, BODY...` where any `0x1A` inside the body is
//! doubled. The body is 7 metadata bytes (48-bit big-endian timestamp plus
//! signal) followed by a type-dependent payload. Position frames reuse the
//! metadata bytes as payload, so the emitter promotes them to the front.
//!
//! The framer also keeps the sync-quality telemetry that drives autobaud
//! and framing-error warnings: a consecutive good-message counter and a
//! count of bytes consumed without sync.

use crate::message::{Message, MessageKind, TimestampDomain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Resync,
    Read1A,
    ReadType,
    ReadData,
    ReadEscaped1A,
}

// Un-escaped body length: 7 metadata bytes plus the wire payload.
fn body_length(kind: MessageKind) -> usize {
    match kind {
        MessageKind::ModeAC => 9,
        MessageKind::ModeSShort => 14,
        MessageKind::ModeSLong | MessageKind::Status | MessageKind::Position => 21,
    }
}

/// Stateful Beast stream decoder for one connection.
pub struct Framer {
    state: ParserState,
    kind: MessageKind, // only meaningful once ReadType has run
    body: Vec<u8>,
    timestamp_domain: TimestampDomain,
    good_sync: bool,
    good_messages: u32,
    bad_bytes: u32,
    bytes_since_sync: u32,
}

impl Default for Framer {
    fn default() -> Framer {
        Framer::new()
    }
}

impl Framer {
    pub fn new() -> Framer {
        Framer {
            state: ParserState::Read1A,
            kind: MessageKind::ModeAC,
            body: Vec::with_capacity(21),
            timestamp_domain: TimestampDomain::Unknown,
            good_sync: false,
            good_messages: 0,
            bad_bytes: 0,
            bytes_since_sync: 0,
        }
    }

    /// Reset to the start-of-connection state. Called on connect and on
    /// autobaud rate changes.
    pub fn reset(&mut self) {
        self.state = ParserState::Read1A;
        self.body.clear();
        self.good_sync = false;
        self.good_messages = 0;
        self.bad_bytes = 0;
        self.bytes_since_sync = 0;
    }

    /// The clock domain stamped onto emitted messages.
    pub fn set_timestamp_domain(&mut self, domain: TimestampDomain) {
        self.timestamp_domain = domain;
    }

    pub fn timestamp_domain(&self) -> TimestampDomain {
        self.timestamp_domain
    }

    /// True if the last parsed message completed without a sync error since.
    pub fn good_sync(&self) -> bool {
        self.good_sync
    }

    /// Consecutive good messages since the last sync loss.
    pub fn good_messages(&self) -> u32 {
        self.good_messages
    }

    /// Bytes consumed without sync since the last good message.
    pub fn bad_bytes(&self) -> u32 {
        self.bad_bytes
    }

    fn lost_sync(&mut self) {
        self.bad_bytes = self.bad_bytes.saturating_add(self.bytes_since_sync);
        self.bytes_since_sync = 0;
        self.good_sync = false;
        self.good_messages = 0;
        self.state = ParserState::Resync;
    }

    fn emit(&mut self, out: &mut Vec<Message>) {
        self.good_sync = true;
        self.good_messages = self.good_messages.saturating_add(1);
        self.bad_bytes = 0;
        self.bytes_since_sync = 0;

        let body = std::mem::take(&mut self.body);
        let message = if self.kind == MessageKind::Position {
            // The metadata bytes are part of the position payload.
            Message::new(self.kind, self.timestamp_domain, 0, 0, body)
        } else {
            let timestamp = ((body[0] as u64) << 40)
                | ((body[1] as u64) << 32)
                | ((body[2] as u64) << 24)
                | ((body[3] as u64) << 16)
                | ((body[4] as u64) << 8)
                | (body[5] as u64);
            Message::new(
                self.kind,
                self.timestamp_domain,
                timestamp,
                body[6],
                body[7..].to_vec(),
            )
        };
        out.push(message);
    }

    /// Consume a chunk of raw input, appending completed messages to `out`.
    pub fn feed(&mut self, buf: &[u8], out: &mut Vec<Message>) {
        let mut i = 0;

        while i < buf.len() {
            match self.state {
                ParserState::Resync => {
                    // Scanning for <not-1A> <1A> <typebyte>: the first byte
                    // of a real frame boundary cannot be an escape.
                    while i < buf.len() {
                        if buf[i] == 0x1A {
                            self.bad_bytes = self.bad_bytes.saturating_add(1);
                            i += 1;
                            continue;
                        }
                        if i + 1 >= buf.len() {
                            // Buffer ran out on the candidate's first byte;
                            // expect the 1A at the start of the next read.
                            self.bad_bytes = self.bad_bytes.saturating_add(1);
                            i += 1;
                            self.state = ParserState::Read1A;
                            break;
                        }
                        if buf[i + 1] == 0x1A {
                            self.bad_bytes = self.bad_bytes.saturating_add(2);
                            i += 2;
                            self.state = ParserState::ReadType;
                            break;
                        }
                        self.bad_bytes = self.bad_bytes.saturating_add(1);
                        i += 1;
                    }
                }

                ParserState::Read1A => {
                    if buf[i] == 0x1A {
                        self.bytes_since_sync += 1;
                        i += 1;
                        self.state = ParserState::ReadType;
                    } else {
                        // Not consumed; Resync rescans this byte.
                        self.lost_sync();
                    }
                }

                ParserState::ReadType => match MessageKind::from_byte(buf[i]) {
                    Some(kind) => {
                        self.kind = kind;
                        self.body.clear();
                        self.bytes_since_sync += 1;
                        i += 1;
                        self.state = ParserState::ReadData;
                    }
                    None => self.lost_sync(),
                },

                ParserState::ReadData => {
                    let need = body_length(self.kind);
                    while i < buf.len() && self.body.len() < need {
                        let b = buf[i];
                        if b == 0x1A {
                            if i + 1 >= buf.len() {
                                // A lone escape at the end of the read; the
                                // next read decides what it was.
                                self.bytes_since_sync += 1;
                                i += 1;
                                self.state = ParserState::ReadEscaped1A;
                                break;
                            }
                            if buf[i + 1] != 0x1A {
                                self.bytes_since_sync += 1;
                                i += 1;
                                self.lost_sync();
                                break;
                            }
                            self.bytes_since_sync += 2;
                            i += 2;
                        } else {
                            self.bytes_since_sync += 1;
                            i += 1;
                        }
                        self.body.push(b);
                    }

                    if self.state == ParserState::ReadData && self.body.len() >= need {
                        self.emit(out);
                        self.state = ParserState::Read1A;
                    }
                }

                ParserState::ReadEscaped1A => {
                    if buf[i] != 0x1A {
                        self.lost_sync();
                        continue;
                    }
                    self.bytes_since_sync += 1;
                    i += 1;
                    self.body.push(0x1A);
                    if self.body.len() >= body_length(self.kind) {
                        self.emit(out);
                        self.state = ParserState::Read1A;
                    } else {
                        self.state = ParserState::ReadData;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(framer: &mut Framer, bytes: &[u8]) -> Vec<Message> {
        let mut out = Vec::new();
        framer.feed(bytes, &mut out);
        out
    }

    // Escape a body and frame it with the type byte.
    fn frame(kind: MessageKind, body: &[u8]) -> Vec<u8> {
        let mut wire = vec![0x1A, kind.to_byte()];
        for &b in body {
            if b == 0x1A {
                wire.push(0x1A);
            }
            wire.push(b);
        }
        wire
    }

    fn short_body(payload: [u8; 7]) -> Vec<u8> {
        let mut body = vec![0x00, 0x00, 0x00, 0x01, 0x86, 0xA0, 0x50]; // ts + signal
        body.extend_from_slice(&payload);
        body
    }

    #[test]
    fn test_single_mode_s_short() {
        let mut framer = Framer::new();
        framer.set_timestamp_domain(TimestampDomain::TwelveMHz);
        let msgs = feed_all(
            &mut framer,
            &frame(
                MessageKind::ModeSShort,
                &short_body([0xAB, 0xCD, 0xEF, 0x12, 0x34, 0x56, 0x78]),
            ),
        );

        assert_eq!(msgs.len(), 1);
        let m = &msgs[0];
        assert_eq!(m.kind(), MessageKind::ModeSShort);
        assert_eq!(m.timestamp(), 0x0000_0001_86A0);
        assert_eq!(m.signal(), 0x50);
        assert_eq!(m.payload(), &[0xAB, 0xCD, 0xEF, 0x12, 0x34, 0x56, 0x78]);
        assert!(framer.good_sync());
        assert_eq!(framer.good_messages(), 1);
        assert_eq!(framer.bad_bytes(), 0);
    }

    #[test]
    fn test_escaped_1a_in_body() {
        let mut framer = Framer::new();
        let body = short_body([0x1A, 0x1A, 0x03, 0x04, 0x05, 0x06, 0x07]);
        let msgs = feed_all(&mut framer, &frame(MessageKind::ModeSShort, &body));

        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0].payload()[..2], &[0x1A, 0x1A]);
    }

    #[test]
    fn test_trailing_escape_split_read() {
        // A lone 0x1A at the end of a read suspends the parse; the escape
        // completes with the first byte of the next read.
        let mut framer = Framer::new();
        let mut chunk1 = vec![0x1A, 0x32];
        chunk1.extend_from_slice(&[0x00; 6]); // timestamp
        chunk1.push(0x00); // signal
        chunk1.extend_from_slice(&[0xAB, 0xCD, 0xEF, 0x12, 0x34, 0x56]);
        chunk1.push(0x1A); // first half of an escaped payload byte

        let msgs = feed_all(&mut framer, &chunk1);
        assert!(msgs.is_empty());

        let msgs = feed_all(&mut framer, &[0x1A]);
        assert_eq!(msgs.len(), 1);
        assert_eq!(
            msgs[0].payload(),
            &[0xAB, 0xCD, 0xEF, 0x12, 0x34, 0x56, 0x1A]
        );
    }

    #[test]
    fn test_invalid_type_loses_sync() {
        let mut framer = Framer::new();
        let msgs = feed_all(&mut framer, &[0x1A, 0x99, 0x01, 0x02]);
        assert!(msgs.is_empty());
        assert!(!framer.good_sync());
        assert_eq!(framer.good_messages(), 0);
        assert!(framer.bad_bytes() > 0);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut framer = Framer::new();
        let mut wire = vec![0x55, 0x66, 0x77]; // garbage: loses sync
        wire.extend_from_slice(&frame(
            MessageKind::ModeSShort,
            &short_body([1, 2, 3, 4, 5, 6, 7]),
        ));
        wire.extend_from_slice(&frame(
            MessageKind::ModeSShort,
            &short_body([8, 9, 10, 11, 12, 13, 14]),
        ));

        // Resync pairs the last garbage byte with the first frame's opening
        // escape, so both frames decode.
        let msgs = feed_all(&mut framer, &wire);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].payload(), &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(msgs[1].payload(), &[8, 9, 10, 11, 12, 13, 14]);
        assert!(framer.good_sync());
    }

    #[test]
    fn test_resync_candidate_split_across_reads() {
        // Buffer ends on the <not-1A> candidate; the <1A> arrives next read.
        let mut framer = Framer::new();
        feed_all(&mut framer, &[0x99, 0x98]); // lose sync, scan, candidate at tail
        let mut chunk2 = vec![0x1A];
        chunk2.extend_from_slice(&frame(
            MessageKind::ModeSShort,
            &short_body([1, 2, 3, 4, 5, 6, 7]),
        )[1..].to_vec());

        let msgs = feed_all(&mut framer, &chunk2);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload(), &[1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_unescaped_1a_mid_body_loses_sync() {
        let mut framer = Framer::new();
        // 0x1A followed by a non-1A inside the body is a framing error.
        let wire = [0x1A, 0x32, 0x00, 0x00, 0x1A, 0x55, 0x00, 0x00];
        let msgs = feed_all(&mut framer, &wire);
        assert!(msgs.is_empty());
        assert!(!framer.good_sync());
    }

    #[test]
    fn test_back_to_back_messages() {
        let mut framer = Framer::new();
        let mut wire = Vec::new();
        for n in 0..4u8 {
            wire.extend_from_slice(&frame(
                MessageKind::ModeSShort,
                &short_body([n, n, n, n, n, n, n]),
            ));
        }
        let msgs = feed_all(&mut framer, &wire);
        assert_eq!(msgs.len(), 4);
        assert_eq!(framer.good_messages(), 4);
        for (n, m) in msgs.iter().enumerate() {
            assert_eq!(m.payload()[0], n as u8);
        }
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        // Messages survive arbitrary read fragmentation.
        let mut framer = Framer::new();
        let wire = frame(
            MessageKind::ModeSLong,
            &{
                let mut b = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x20];
                b.extend_from_slice(&[0x1A; 14]);
                b
            },
        );
        let mut out = Vec::new();
        for &b in &wire {
            framer.feed(&[b], &mut out);
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload(), &[0x1A; 14]);
    }

    #[test]
    fn test_position_metadata_promotion() {
        // A position frame's first 7 body bytes lead the emitted payload.
        let mut framer = Framer::new();
        let mut body = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03];
        body.extend_from_slice(&[0x10; 14]);
        let msgs = feed_all(&mut framer, &frame(MessageKind::Position, &body));

        assert_eq!(msgs.len(), 1);
        let m = &msgs[0];
        assert_eq!(m.kind(), MessageKind::Position);
        assert_eq!(m.payload().len(), 21);
        assert_eq!(&m.payload()[..7], &[0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03]);
        assert_eq!(m.timestamp(), 0);
        assert_eq!(m.signal(), 0);
    }

    #[test]
    fn test_status_message() {
        let mut framer = Framer::new();
        framer.set_timestamp_domain(TimestampDomain::Gps);
        let mut body = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        body.extend_from_slice(&[0x11; 14]);
        let msgs = feed_all(&mut framer, &frame(MessageKind::Status, &body));
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), MessageKind::Status);
        assert_eq!(msgs[0].timestamp_domain(), TimestampDomain::Gps);
        assert_eq!(msgs[0].payload().len(), 14);
    }

    #[test]
    fn test_mode_ac_length() {
        let mut framer = Framer::new();
        let msgs = feed_all(
            &mut framer,
            &frame(
                MessageKind::ModeAC,
                &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x30, 0x21, 0x43],
            ),
        );
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), MessageKind::ModeAC);
        assert_eq!(msgs[0].payload(), &[0x21, 0x43]);
    }

    #[test]
    fn test_bad_bytes_accumulate_without_sync() {
        let mut framer = Framer::new();
        feed_all(&mut framer, &[0x42]); // Read1A expects 0x1A: sync lost
        let before = framer.bad_bytes();
        feed_all(&mut framer, &[0x55; 32]); // no frame boundary anywhere
        assert!(framer.bad_bytes() > before);
        assert!(framer.bad_bytes() >= 32);
    }

    #[test]
    fn test_emit_clears_bad_bytes() {
        let mut framer = Framer::new();
        feed_all(&mut framer, &[0x55; 10]);
        assert!(framer.bad_bytes() > 0);

        // The garbage buffer ended on a deferred candidate, so the next
        // frame boundary is picked up directly.
        let msgs = feed_all(
            &mut framer,
            &frame(
                MessageKind::ModeSShort,
                &short_body([1, 2, 3, 4, 5, 6, 7]),
            ),
        );
        assert_eq!(msgs.len(), 1);
        assert_eq!(framer.bad_bytes(), 0);
        assert!(framer.good_sync());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut framer = Framer::new();
        feed_all(&mut framer, &[0x55; 10]);
        framer.reset();
        assert_eq!(framer.bad_bytes(), 0);
        assert_eq!(framer.good_messages(), 0);
        assert!(!framer.good_sync());

        // And parsing starts at a frame boundary again.
        let msgs = feed_all(
            &mut framer,
            &frame(
                MessageKind::ModeSShort,
                &short_body([1, 2, 3, 4, 5, 6, 7]),
            ),
        );
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn test_reencode_is_subsequence_of_input() {
        // Re-encoding the decoded messages reproduces the frame bytes that
        // follow the garbage prefix: no duplication, no reordering.
        let mut clean = Vec::new();
        for n in 0..3u8 {
            clean.extend_from_slice(&frame(
                MessageKind::ModeSShort,
                &short_body([n, 0x1A, n, n, n, n, n]),
            ));
        }

        let mut framer = Framer::new();
        let msgs = feed_all(&mut framer, &clean);
        assert_eq!(msgs.len(), 3);

        let mut reencoded = Vec::new();
        for m in &msgs {
            let mut body = vec![
                (m.timestamp() >> 40) as u8,
                (m.timestamp() >> 32) as u8,
                (m.timestamp() >> 24) as u8,
                (m.timestamp() >> 16) as u8,
                (m.timestamp() >> 8) as u8,
                m.timestamp() as u8,
                m.signal(),
            ];
            body.extend_from_slice(m.payload());
            reencoded.extend_from_slice(&frame(m.kind(), &body));
        }
        assert_eq!(reencoded, clean);
    }
}
