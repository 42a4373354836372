//! Bluetooth link and call state machine, evaluated every 20 ms.
//!
//! Sits between the BM64 codec and the POTS line: module events (link
//! service, call lifecycle) come in from the codec, handset events
//! (`hook_change`, `digit_dialed`) come in from the line, and the machine
//! answers with MMI commands on the wire and level directives
//! (`set_in_service` / `set_in_call` / `set_ring`) back to the line.
//!
//! The module is authoritative for call state; nothing here retries or
//! second-guesses it. When service drops, every path funnels into
//! `Disconnected` and the reconnect countdown starts over.

use crate::hardware::Port;
use crate::pots::PotsLine;
use crate::protocols::bm64::{self, CallState, Codec, Event};

/// Reconnect attempt interval: 60 s at the 20 ms cadence.
pub const RETRY_TICKS: u32 = 3_000;

/// A number is dispatched only when this many digits have been dialed.
pub const NUM_VALID_DIGITS: usize = bm64::DIAL_NUMBER_DIGITS;

/// Speaker gain pushed to the module when a call goes active.
const SPEAKER_GAIN: u8 = 0x0E;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Disconnected,
    ConnectedIdle,
    Dialing,
    CallInitiated,
    CallOutgoing,
    CallActive,
    CallReceived,
}

pub struct BtLink {
    state: LinkState,
    /// Latest module-reported call lifecycle.
    call: CallState,
    in_service: bool,
    retry_ticks: u32,
    dial_buf: heapless::Vec<u8, NUM_VALID_DIGITS>,
    slot: u8,
}

impl BtLink {
    pub fn new(slot: u8) -> Self {
        Self {
            state: LinkState::Disconnected,
            call: CallState::Idle,
            in_service: false,
            retry_ticks: RETRY_TICKS,
            dial_buf: heapless::Vec::new(),
            slot,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn in_service(&self) -> bool {
        self.in_service
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn set_slot(&mut self, slot: u8) {
        self.slot = slot;
    }

    /// One 20 ms evaluation pass: drain the codec, then run the machine with
    /// the freshest link/call picture.
    pub fn tick<P: Port>(&mut self, port: &mut P, codec: &mut Codec, pots: &mut PotsLine) {
        while let Some(byte) = port.uart_read() {
            if let Some(evt) = codec.feed(port, byte) {
                self.absorb(evt);
            }
        }

        let hook = pots.take_hook_change();
        let digit = pots.take_digit();

        if !self.in_service && self.state != LinkState::Disconnected {
            self.enter_disconnected(pots);
            return;
        }

        match self.state {
            LinkState::Disconnected => {
                if self.in_service {
                    self.enter_connected_idle(pots);
                } else {
                    self.retry_ticks -= 1;
                    if self.retry_ticks == 0 {
                        bm64::send_link_back(port, self.slot);
                        self.retry_ticks = RETRY_TICKS;
                    }
                }
            }
            LinkState::ConnectedIdle => {
                if self.call == CallState::Incoming {
                    self.state = LinkState::CallReceived;
                    pots.set_ring(true);
                } else if self.call == CallState::Active {
                    self.enter_call_active(port, pots);
                } else if hook == Some(true) {
                    self.state = LinkState::Dialing;
                    self.dial_buf.clear();
                }
            }
            LinkState::Dialing => {
                if self.call == CallState::Active {
                    self.enter_call_active(port, pots);
                } else if hook == Some(false) {
                    self.enter_connected_idle(pots);
                } else if let Some(d) = digit {
                    if d == 0 && self.dial_buf.is_empty() {
                        bm64::send_mmi(port, bm64::MMI_VOICE_DIAL);
                        self.state = LinkState::CallInitiated;
                    } else {
                        let _ = self.dial_buf.push(d);
                        if self.dial_buf.is_full() {
                            bm64::send_dial_number(port, &self.dial_buf);
                            self.state = LinkState::CallInitiated;
                        }
                    }
                }
            }
            LinkState::CallInitiated => {
                if self.call == CallState::Active {
                    self.enter_call_active(port, pots);
                } else if self.call == CallState::Outgoing {
                    self.state = LinkState::CallOutgoing;
                } else if hook == Some(false) {
                    bm64::send_mmi(port, bm64::MMI_DROP_CALL);
                    self.enter_connected_idle(pots);
                }
            }
            LinkState::CallOutgoing => {
                if self.call == CallState::Active {
                    self.enter_call_active(port, pots);
                } else if self.call == CallState::Idle {
                    self.enter_connected_idle(pots);
                } else if hook == Some(false) {
                    bm64::send_mmi(port, bm64::MMI_DROP_CALL);
                    self.enter_connected_idle(pots);
                }
            }
            LinkState::CallActive => {
                if self.call == CallState::Idle {
                    self.enter_connected_idle(pots);
                } else if hook == Some(false) {
                    bm64::send_mmi(port, bm64::MMI_DROP_CALL);
                    self.enter_connected_idle(pots);
                }
            }
            LinkState::CallReceived => {
                if hook == Some(true) {
                    bm64::send_mmi(port, bm64::MMI_ACCEPT_CALL);
                    self.enter_call_active(port, pots);
                } else if self.call == CallState::Active {
                    self.enter_call_active(port, pots);
                } else if self.call != CallState::Incoming {
                    self.enter_connected_idle(pots);
                }
            }
        }
    }

    fn absorb(&mut self, evt: Event) {
        match evt {
            Event::LinkUp => self.in_service = true,
            Event::LinkDown => self.in_service = false,
            Event::Call(call) => self.call = call,
            Event::CallerId | Event::Other(_) => {}
        }
    }

    fn enter_connected_idle(&mut self, pots: &mut PotsLine) {
        self.state = LinkState::ConnectedIdle;
        self.retry_ticks = RETRY_TICKS;
        pots.set_in_service(true);
        pots.set_in_call(false);
        pots.set_ring(false);
    }

    fn enter_call_active<P: Port>(&mut self, port: &mut P, pots: &mut PotsLine) {
        self.state = LinkState::CallActive;
        bm64::send_speaker_gain(port, SPEAKER_GAIN);
        pots.set_in_call(true);
        pots.set_ring(false);
    }

    fn enter_disconnected(&mut self, pots: &mut PotsLine) {
        self.state = LinkState::Disconnected;
        // The module's call picture died with the link.
        self.call = CallState::Idle;
        self.retry_ticks = RETRY_TICKS;
        pots.set_in_service(false);
        pots.set_in_call(false);
        pots.set_ring(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockPort;
    use crate::pots::RingState;

    const LINK_UP: [u8; 7] = [0x00, 0xAA, 0x00, 0x02, 0x01, 0x05, 0xF8];
    const LINK_DOWN: [u8; 7] = [0x00, 0xAA, 0x00, 0x02, 0x01, 0x07, 0xF6];

    fn call_status(call: u8) -> [u8; 8] {
        let chk = (!(0x05u8.wrapping_add(call))).wrapping_add(1);
        [0x00, 0xAA, 0x00, 0x03, 0x02, 0x00, call, chk]
    }

    struct Rig {
        port: MockPort,
        codec: Codec,
        pots: PotsLine,
        bt: BtLink,
    }

    impl Rig {
        fn new(slot: u8) -> Self {
            Self {
                port: MockPort::new(),
                codec: Codec::new(),
                pots: PotsLine::new(),
                bt: BtLink::new(slot),
            }
        }

        fn bt_tick(&mut self) {
            self.bt.tick(&mut self.port, &mut self.codec, &mut self.pots);
        }

        fn inject(&mut self, frame: &[u8]) {
            self.port.feed_uart(frame);
            self.bt_tick();
            self.port.uart_tx.clear(); // discard the event-ack
        }

        fn connect(&mut self) {
            self.inject(&LINK_UP);
            assert_eq!(self.bt.state(), LinkState::ConnectedIdle);
        }

        fn lift_handset(&mut self) {
            self.port.set_shk(true);
            self.pots.tick(&mut self.port);
            self.pots.tick(&mut self.port);
        }

        fn hang_up(&mut self) {
            self.port.set_shk(false);
            for _ in 0..crate::pots::HANGUP_CONFIRM_TICKS + 3 {
                self.pots.tick(&mut self.port);
            }
        }

        /// Key one DTMF digit through the line machine.
        fn dial_digit(&mut self, d: u8) {
            self.port.dtmf = Some(d);
            for _ in 0..4 {
                self.pots.tick(&mut self.port);
            }
            self.port.dtmf = None;
            for _ in 0..3 {
                self.pots.tick(&mut self.port);
            }
            self.bt_tick();
        }
    }

    #[test]
    fn cold_start_retries_link_back_after_60_s() {
        let mut rig = Rig::new(3);
        for _ in 0..RETRY_TICKS - 1 {
            rig.bt_tick();
        }
        assert!(rig.port.uart_tx.is_empty());
        rig.bt_tick();
        assert_eq!(
            &rig.port.uart_tx[..],
            &[0x00, 0xAA, 0x00, 0x04, 0x17, 0x04, 0x03, 0x03, 0xDB]
        );
        // Exactly one per interval.
        rig.port.uart_tx.clear();
        rig.bt_tick();
        assert!(rig.port.uart_tx.is_empty());
    }

    #[test]
    fn incoming_call_rings_and_off_hook_accepts() {
        let mut rig = Rig::new(0);
        rig.connect();
        rig.inject(&call_status(0x02));
        assert_eq!(rig.bt.state(), LinkState::CallReceived);

        // The ring directive reaches the SLIC on the next line ticks.
        rig.pots.tick(&mut rig.port);
        assert_ne!(rig.pots.ring_state(), RingState::Idle);

        rig.lift_handset();
        rig.bt_tick();
        assert_eq!(
            &rig.port.uart_tx[..],
            &[
                0x00, 0xAA, 0x00, 0x03, 0x02, 0x00, 0x04, 0xF7, // AcceptCall
                0x00, 0xAA, 0x00, 0x03, 0x1B, 0x00, 0x0E, 0xD4, // SetSpeakerGain
            ]
        );
        assert_eq!(rig.bt.state(), LinkState::CallActive);

        rig.pots.tick(&mut rig.port);
        assert_eq!(rig.pots.ring_state(), RingState::Idle);
    }

    #[test]
    fn first_digit_zero_voice_dials() {
        let mut rig = Rig::new(0);
        rig.connect();
        rig.lift_handset();
        rig.bt_tick();
        assert_eq!(rig.bt.state(), LinkState::Dialing);

        rig.dial_digit(0);
        assert_eq!(
            &rig.port.uart_tx[..],
            &[0x00, 0xAA, 0x00, 0x03, 0x02, 0x00, 0x0A, 0xF1]
        );
        assert_eq!(rig.bt.state(), LinkState::CallInitiated);
    }

    #[test]
    fn ten_digits_dispatch_one_dial_number_packet() {
        let mut rig = Rig::new(0);
        rig.connect();
        rig.lift_handset();
        rig.bt_tick();

        let digits = [5, 5, 5, 1, 2, 3, 4, 10, 11, 0];
        for &d in &digits {
            assert!(rig.port.uart_tx.is_empty());
            rig.dial_digit(d);
        }
        assert_eq!(rig.bt.state(), LinkState::CallInitiated);

        let frame = &rig.port.uart_tx[..];
        assert_eq!(&frame[..4], &[0x00, 0xAA, 0x00, 0x0C]);
        assert_eq!(&frame[4..6], &[0x00, 0x00]);
        assert_eq!(&frame[6..16], b"5551234*#0");
        let sum: u8 = frame[2..].iter().fold(0u8, |s, &b| s.wrapping_add(b));
        assert_eq!(sum, 0);
        assert_eq!(frame.len(), 17);
    }

    #[test]
    fn hanging_up_mid_call_drops_it() {
        let mut rig = Rig::new(0);
        rig.connect();
        rig.lift_handset();
        rig.bt_tick();
        rig.dial_digit(0);
        rig.inject(&call_status(0x04));
        assert_eq!(rig.bt.state(), LinkState::CallActive);
        rig.port.uart_tx.clear();

        rig.hang_up();
        rig.bt_tick();
        assert_eq!(
            &rig.port.uart_tx[..],
            &[0x00, 0xAA, 0x00, 0x03, 0x02, 0x00, 0x06, 0xF5]
        );
        assert_eq!(rig.bt.state(), LinkState::ConnectedIdle);
    }

    #[test]
    fn remote_hangup_returns_to_idle_without_drop_command() {
        let mut rig = Rig::new(0);
        rig.connect();
        rig.inject(&call_status(0x04));
        assert_eq!(rig.bt.state(), LinkState::CallActive);

        rig.port.feed_uart(&call_status(0x00));
        rig.bt_tick();
        assert_eq!(rig.bt.state(), LinkState::ConnectedIdle);
        // Only the event-ack went out; no DropCall for a remote hang-up.
        assert_eq!(&rig.port.uart_tx[..], &[0x00, 0xAA, 0x00, 0x02, 0x14, 0x02, 0xE8]);
    }

    #[test]
    fn call_active_is_reached_from_any_connected_state() {
        // Straight from ConnectedIdle, per the module's authority.
        let mut rig = Rig::new(0);
        rig.connect();
        rig.port.feed_uart(&call_status(0x04));
        rig.bt_tick();
        assert_eq!(rig.bt.state(), LinkState::CallActive);
        // Entry pushes the speaker gain, right behind the event-ack.
        assert_eq!(
            &rig.port.uart_tx[..],
            &[
                0x00, 0xAA, 0x00, 0x02, 0x14, 0x02, 0xE8, // ack
                0x00, 0xAA, 0x00, 0x03, 0x1B, 0x00, 0x0E, 0xD4, // SetSpeakerGain
            ]
        );
    }

    #[test]
    fn link_drop_mid_call_clears_the_line_and_schedules_retry() {
        let mut rig = Rig::new(5);
        rig.connect();
        rig.inject(&call_status(0x04));
        assert_eq!(rig.bt.state(), LinkState::CallActive);

        rig.inject(&LINK_DOWN);
        assert_eq!(rig.bt.state(), LinkState::Disconnected);
        assert!(!rig.bt.in_service());
        rig.pots.tick(&mut rig.port);
        assert_eq!(rig.pots.ring_state(), RingState::Idle);

        for _ in 0..RETRY_TICKS {
            rig.bt_tick();
        }
        assert_eq!(
            &rig.port.uart_tx[..],
            &[0x00, 0xAA, 0x00, 0x04, 0x17, 0x04, 0x05, 0x03, 0xD9]
        );
    }

    #[test]
    fn abandoned_incoming_call_stops_ringing() {
        let mut rig = Rig::new(0);
        rig.connect();
        rig.inject(&call_status(0x02));
        assert_eq!(rig.bt.state(), LinkState::CallReceived);
        rig.pots.tick(&mut rig.port);

        rig.inject(&call_status(0x00));
        assert_eq!(rig.bt.state(), LinkState::ConnectedIdle);
        rig.pots.tick(&mut rig.port);
        rig.pots.tick(&mut rig.port);
        assert_eq!(rig.pots.ring_state(), RingState::Idle);
    }

    #[test]
    fn on_hook_while_dialing_abandons_the_attempt() {
        let mut rig = Rig::new(0);
        rig.connect();
        rig.lift_handset();
        rig.bt_tick();
        rig.dial_digit(5);
        assert_eq!(rig.bt.state(), LinkState::Dialing);

        rig.hang_up();
        rig.bt_tick();
        assert_eq!(rig.bt.state(), LinkState::ConnectedIdle);
        assert!(rig.port.uart_tx.is_empty());
    }
}
