//! BM64 UART wire protocol: framing, checksum, event dispatch.
//!
//! Both directions use the same frame:
//!
//! `00 AA LEN_HI LEN_LO CMD PAYLOAD[LEN-1] CHK`
//!
//! `LEN` counts the bytes from CMD through the last payload byte, inclusive.
//! `CHK` is the two's complement of the byte sum from LEN_HI through the last
//! payload byte, so the sum of everything after the sync pair, checksum
//! included, is 0 mod 256.
//!
//! The module requires every *event* frame (CMD ≠ 0) to be acknowledged with
//! `14 <event-id>`. The link is trusted: frames that fail the checksum are
//! dropped without a NAK, and nothing is ever retransmitted.

use num_enum::TryFromPrimitive;

use crate::hardware::{ConsoleOut, Port};
use core::fmt::Write;

/// Receive frame assembly buffer, LEN_HI through the last payload byte.
pub const FRAME_BUF_SIZE: usize = 32;

/// Largest outbound payload (CMD + parameters) the encoder accepts.
pub const MAX_TX_PAYLOAD: usize = FRAME_BUF_SIZE - 2;

const SYNC0: u8 = 0x00;
const SYNC1: u8 = 0xAA;

// Event ids reported by the module.
pub const EVT_BTM_STATUS: u8 = 0x01;
pub const EVT_CALL_STATUS: u8 = 0x02;
pub const EVT_CALLER_ID: u8 = 0x03;

// BTM status payload values we act on; everything else is ignored.
const BTM_STATUS_LINK_UP: u8 = 0x05;
const BTM_STATUS_LINK_DOWN: u8 = 0x07;

// Outbound command ids.
pub const CMD_MAKE_CALL: u8 = 0x00;
pub const CMD_MMI_ACTION: u8 = 0x02;
pub const CMD_EVENT_ACK: u8 = 0x14;
pub const CMD_PROFILE_LINK_BACK: u8 = 0x17;
pub const CMD_SET_SPEAKER_GAIN: u8 = 0x1B;

// MMI actions (second parameter byte of CMD_MMI_ACTION).
pub const MMI_ACCEPT_CALL: u8 = 0x04;
pub const MMI_DROP_CALL: u8 = 0x06;
pub const MMI_VOICE_DIAL: u8 = 0x0A;
pub const MMI_ENTER_PAIRING: u8 = 0x5D;

/// Digits a DialNumber frame carries; the wire format is fixed-width.
pub const DIAL_NUMBER_DIGITS: usize = 10;

/// Call lifecycle as the module reports it in Call_Status events.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CallState {
    Idle = 0,
    VoiceDial = 1,
    Incoming = 2,
    Outgoing = 3,
    Active = 4,
}

/// Decoded, validated inbound frames, classified for the link machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    LinkUp,
    LinkDown,
    Call(CallState),
    /// Caller-ID string; already surfaced on the console.
    CallerId,
    /// Valid and acked, but nothing we act on.
    Other(u8),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RxState {
    Idle,
    Sync,
    LenHi,
    LenLo,
    Cmd,
    Data,
    Checksum,
}

/// Byte-driven receive machine plus the symmetric encoder's state (none).
pub struct Codec {
    state: RxState,
    buf: [u8; FRAME_BUF_SIZE],
    idx: usize,
    len: usize,
    /// Dump raw hex of every completed frame to the console.
    pub verbose: bool,
}

impl Codec {
    pub fn new() -> Self {
        Self {
            state: RxState::Idle,
            buf: [0; FRAME_BUF_SIZE],
            idx: 0,
            len: 0,
            verbose: false,
        }
    }

    /// True between frames; the machine must come back here after every
    /// completed or malformed frame.
    pub fn is_idle(&self) -> bool {
        self.state == RxState::Idle
    }

    /// Advance the receive machine by one byte. Returns a classified event
    /// when the byte completes a valid event frame.
    pub fn feed<P: Port>(&mut self, port: &mut P, byte: u8) -> Option<Event> {
        match self.state {
            RxState::Idle => {
                if byte == SYNC0 {
                    self.state = RxState::Sync;
                }
            }
            RxState::Sync => {
                // No partial resync: anything but the second sync byte
                // restarts the hunt.
                self.state = if byte == SYNC1 { RxState::LenHi } else { RxState::Idle };
                self.idx = 0;
            }
            RxState::LenHi => {
                self.buf[0] = byte;
                self.len = (byte as usize) << 8;
                self.idx = 1;
                self.state = RxState::LenLo;
            }
            RxState::LenLo => {
                self.buf[1] = byte;
                self.len |= byte as usize;
                self.idx = 2;
                // LEN counts CMD..last payload byte; the buffer also holds the
                // two length bytes.
                if self.len == 0 || self.len + 2 > FRAME_BUF_SIZE {
                    self.state = RxState::Idle;
                } else {
                    self.state = RxState::Cmd;
                }
            }
            RxState::Cmd => {
                self.buf[2] = byte;
                self.idx = 3;
                self.state = if self.idx == self.len + 2 {
                    RxState::Checksum
                } else {
                    RxState::Data
                };
            }
            RxState::Data => {
                self.buf[self.idx] = byte;
                self.idx += 1;
                if self.idx == self.len + 2 {
                    self.state = RxState::Checksum;
                }
            }
            RxState::Checksum => {
                self.state = RxState::Idle;
                let ok = checksum(&self.buf[..self.idx]) == byte;
                if self.verbose {
                    self.dump(port, ok, byte);
                }
                if ok {
                    let cmd = self.buf[2];
                    // Events only; never ack a mismatched frame.
                    if cmd != 0 {
                        send_frame(port, &[CMD_EVENT_ACK, cmd]);
                        return Some(self.classify(port, cmd));
                    }
                }
            }
        }
        None
    }

    fn classify<P: Port>(&self, port: &mut P, cmd: u8) -> Event {
        let payload = &self.buf[3..self.idx];
        match cmd {
            EVT_BTM_STATUS if !payload.is_empty() => match payload[0] {
                BTM_STATUS_LINK_UP => Event::LinkUp,
                BTM_STATUS_LINK_DOWN => Event::LinkDown,
                _ => Event::Other(cmd),
            },
            EVT_CALL_STATUS if payload.len() >= 2 => match CallState::try_from(payload[1]) {
                Ok(call) => Event::Call(call),
                // Unknown lifecycle values leave the prior call state alone.
                Err(_) => Event::Other(cmd),
            },
            EVT_CALLER_ID if payload.len() >= 2 => {
                let mut out = ConsoleOut(port);
                let _ = out.write_str("Caller ID: ");
                for &b in &payload[1..] {
                    let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
                    let _ = out.write_char(c);
                }
                let _ = out.write_str("\r\n");
                Event::CallerId
            }
            _ => Event::Other(cmd),
        }
    }

    fn dump<P: Port>(&self, port: &mut P, ok: bool, chk: u8) {
        let mut out = ConsoleOut(port);
        if !ok {
            let _ = out.write_str("BAD ");
        }
        let _ = write!(out, "{:02X} {:02X}", SYNC0, SYNC1);
        for &b in &self.buf[..self.idx] {
            let _ = write!(out, " {:02X}", b);
        }
        let _ = write!(out, " {:02X}\r\n", chk);
    }
}

/// Two's complement of the byte sum; a valid frame's bytes after the sync
/// pair, checksum included, sum to 0 mod 256.
fn checksum(bytes: &[u8]) -> u8 {
    let mut sum = 0u8;
    for &b in bytes {
        sum = sum.wrapping_add(b);
    }
    (!sum).wrapping_add(1)
}

/// Frame and transmit one outbound command; `payload` is CMD plus parameters.
/// Fire-and-forget: the wire is trusted, there is no retransmission.
pub fn send_frame<P: Port>(port: &mut P, payload: &[u8]) {
    debug_assert!(!payload.is_empty() && payload.len() <= MAX_TX_PAYLOAD);
    let len = payload.len() as u16;
    let len_bytes = len.to_be_bytes();
    let mut sum = len_bytes[0].wrapping_add(len_bytes[1]);
    for &b in payload {
        sum = sum.wrapping_add(b);
    }
    port.uart_write(&[SYNC0, SYNC1]);
    port.uart_write(&len_bytes);
    port.uart_write(payload);
    port.uart_write(&[(!sum).wrapping_add(1)]);
}

/// One MMI action (accept, drop, voice dial, enter pairing, ...).
pub fn send_mmi<P: Port>(port: &mut P, action: u8) {
    send_frame(port, &[CMD_MMI_ACTION, 0x00, action]);
}

/// Ask the module to link back to a stored pairing slot.
pub fn send_link_back<P: Port>(port: &mut P, slot: u8) {
    send_frame(port, &[CMD_PROFILE_LINK_BACK, 0x04, slot, 0x03]);
}

pub fn send_speaker_gain<P: Port>(port: &mut P, gain: u8) {
    send_frame(port, &[CMD_SET_SPEAKER_GAIN, 0x00, gain & 0x0F]);
}

/// Place a call to a fully dialed number. `digits` are dial codes 0..=11
/// (10 ≡ '*', 11 ≡ '#'); the wire carries them as ASCII behind a two-byte
/// prefix, so LEN is always digits + 2 regardless of the number dialed.
pub fn send_dial_number<P: Port>(port: &mut P, digits: &[u8]) {
    let mut payload = [0u8; 2 + DIAL_NUMBER_DIGITS];
    payload[0] = CMD_MAKE_CALL;
    payload[1] = 0x00;
    for (out, &d) in payload[2..].iter_mut().zip(digits) {
        *out = digit_to_ascii(d);
    }
    send_frame(port, &payload[..2 + digits.len()]);
}

pub fn digit_to_ascii(d: u8) -> u8 {
    match d {
        crate::hardware::DIGIT_STAR => b'*',
        crate::hardware::DIGIT_POUND => b'#',
        _ => b'0' + d,
    }
}
