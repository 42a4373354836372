//! Cooperative scheduling: two fixed cadences over one poll loop.
//!
//! The line machine runs every 10 ms and the link machine every 20 ms. The
//! loop itself spins as fast as the board lets it; each cadence latches the
//! monotonic clock and fires when its period has elapsed, so jittery wakeups
//! cost nothing and a counter wrap is just another subtraction.

use core::fmt::Write;

use crate::bt::BtLink;
use crate::cfg_storage::SlotStore;
use crate::cmd::{CmdError, CmdProcessor, Command, HELP_TEXT};
use crate::hardware::{ConsoleOut, PinId, Port, ResetSequencer};
use crate::pots::PotsLine;
use crate::protocols::bm64::{self, Codec};

pub const POTS_TICK_MS: u64 = 10;
pub const BT_TICK_MS: u64 = 20;

/// One periodic rate. Elapsed time is computed with modular subtraction on
/// the millisecond counter; comparing raw timestamps would break at wrap.
pub struct Cadence {
    period_ms: u64,
    last_ms: u64,
}

impl Cadence {
    pub fn new(period_ms: u64) -> Self {
        Self { period_ms, last_ms: 0 }
    }

    pub fn due(&mut self, now_ms: u64) -> bool {
        if now_ms.wrapping_sub(self.last_ms) >= self.period_ms {
            self.last_ms = now_ms;
            true
        } else {
            false
        }
    }
}

/// The whole gateway: codec, line, link, command surface, and the cadences
/// that sequence them. The board loop just calls [`Gateway::poll`] forever.
pub struct Gateway {
    pub codec: Codec,
    pub pots: PotsLine,
    pub bt: BtLink,
    cmd: CmdProcessor,
    reset: ResetSequencer,
    pots_cadence: Cadence,
    bt_cadence: Cadence,
}

impl Gateway {
    pub fn new(slot: u8) -> Self {
        Self {
            codec: Codec::new(),
            pots: PotsLine::new(),
            bt: BtLink::new(slot),
            cmd: CmdProcessor::new(),
            reset: ResetSequencer::new(),
            pots_cadence: Cadence::new(POTS_TICK_MS),
            bt_cadence: Cadence::new(BT_TICK_MS),
        }
    }

    /// One pass of the loop: console input, then the line at 10 ms, then the
    /// link at 20 ms (which drains the module UART before evaluating).
    pub fn poll<P: Port, S: SlotStore>(&mut self, port: &mut P, store: &mut S) {
        while let Some(byte) = port.console_read() {
            match self.cmd.feed(byte) {
                Some(Ok(command)) => self.apply(port, store, command),
                Some(Err(CmdError::TooLong)) => {
                    port.console_write(b"Packet too long\r\n");
                }
                Some(Err(CmdError::Illegal)) => {
                    port.console_write(b"Illegal command\r\n");
                }
                None => {}
            }
        }

        // A console-requested module reset runs off the clock so the
        // cadences below never miss a tick during the hold.
        self.reset.run(port);

        let now = port.monotonic_ms();
        if self.pots_cadence.due(now) {
            self.pots.tick(port);
        }
        if self.bt_cadence.due(now) {
            self.bt.tick(port, &mut self.codec, &mut self.pots);
            port.gpio_write(PinId::Led, self.bt.in_service());
        }
    }

    fn apply<P: Port, S: SlotStore>(&mut self, port: &mut P, store: &mut S, command: Command) {
        match command {
            Command::ShowSlot => {
                let mut out = ConsoleOut(port);
                let _ = write!(out, "Pairing slot: {}\r\n", self.bt.slot());
            }
            Command::SetSlot(slot) => {
                store.save_slot(slot);
                self.bt.set_slot(slot);
                let mut out = ConsoleOut(port);
                let _ = write!(out, "Pairing slot: {}\r\n", slot);
            }
            Command::EnterPairing => bm64::send_mmi(port, bm64::MMI_ENTER_PAIRING),
            Command::Inject(bytes) => bm64::send_frame(port, &bytes),
            Command::Reset => {
                port.console_write(b"Resetting module\r\n");
                self.reset.start(port);
            }
            Command::Verbose(on) => self.codec.verbose = on,
            Command::Help => port.console_write(HELP_TEXT.as_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bt::LinkState;
    use crate::cfg_storage::mock::MemStore;
    use crate::hardware::mock::MockPort;
    use crate::pots::{LineState, RingState};

    const LINK_UP: [u8; 7] = [0x00, 0xAA, 0x00, 0x02, 0x01, 0x05, 0xF8];
    const CALL_INCOMING: [u8; 8] = [0x00, 0xAA, 0x00, 0x03, 0x02, 0x00, 0x02, 0xF9];
    const CALL_ACTIVE: [u8; 8] = [0x00, 0xAA, 0x00, 0x03, 0x02, 0x00, 0x04, 0xF7];

    fn run_ms(gw: &mut Gateway, port: &mut MockPort, store: &mut MemStore, ms: u64) {
        for _ in 0..ms {
            port.now += 1;
            gw.poll(port, store);
        }
    }

    #[test]
    fn cadence_fires_once_per_period() {
        let mut c = Cadence::new(10);
        assert!(!c.due(0));
        assert!(!c.due(9));
        assert!(c.due(10));
        assert!(!c.due(15));
        assert!(c.due(21));
        assert!(!c.due(29));
    }

    #[test]
    fn cadence_survives_counter_wrap() {
        let mut c = Cadence::new(20);
        assert!(c.due(u64::MAX - 5));
        assert!(!c.due(u64::MAX - 1));
        // 6 ms before wrap + 14 after = one period.
        assert!(c.due(14));
    }

    #[test]
    fn incoming_call_rings_within_a_tick_and_answers_within_two() {
        let mut port = MockPort::new();
        let mut store = MemStore(None);
        let mut gw = Gateway::new(0);

        port.feed_uart(&LINK_UP);
        run_ms(&mut gw, &mut port, &mut store, 30);
        assert_eq!(gw.bt.state(), LinkState::ConnectedIdle);

        port.feed_uart(&CALL_INCOMING);
        run_ms(&mut gw, &mut port, &mut store, 40);
        assert_eq!(gw.bt.state(), LinkState::CallReceived);
        assert_eq!(gw.pots.line_state(), LineState::Ringing);
        assert!(port.pin(PinId::Rm));

        // Lift the receiver: accept goes out within 40 ms.
        port.uart_tx.clear();
        port.set_shk(true);
        run_ms(&mut gw, &mut port, &mut store, 40);
        assert_eq!(
            &port.uart_tx[..],
            &[
                0x00, 0xAA, 0x00, 0x03, 0x02, 0x00, 0x04, 0xF7, // AcceptCall
                0x00, 0xAA, 0x00, 0x03, 0x1B, 0x00, 0x0E, 0xD4, // SetSpeakerGain
            ]
        );
        assert_eq!(gw.pots.line_state(), LineState::OffHook);
        assert_eq!(gw.pots.ring_state(), RingState::Idle);
        assert!(!port.pin(PinId::Rm));

        port.uart_tx.clear();
        port.feed_uart(&CALL_ACTIVE);
        run_ms(&mut gw, &mut port, &mut store, 30);
        assert_eq!(gw.bt.state(), LinkState::CallActive);
    }

    #[test]
    fn led_follows_link_service() {
        let mut port = MockPort::new();
        let mut store = MemStore(None);
        let mut gw = Gateway::new(0);

        run_ms(&mut gw, &mut port, &mut store, 25);
        assert!(!port.pin(PinId::Led));
        port.feed_uart(&LINK_UP);
        run_ms(&mut gw, &mut port, &mut store, 25);
        assert!(port.pin(PinId::Led));
    }

    #[test]
    fn slot_command_persists_and_applies() {
        let mut port = MockPort::new();
        let mut store = MemStore(None);
        let mut gw = Gateway::new(0);

        port.feed_console(b"D=5\n");
        run_ms(&mut gw, &mut port, &mut store, 1);
        assert_eq!(store.0, Some(5));
        assert_eq!(gw.bt.slot(), 5);
        assert!(port.console_str().contains("Pairing slot: 5"));
    }

    #[test]
    fn pairing_command_sends_the_mmi_frame() {
        let mut port = MockPort::new();
        let mut store = MemStore(None);
        let mut gw = Gateway::new(0);

        port.feed_console(b"L\n");
        run_ms(&mut gw, &mut port, &mut store, 1);
        assert_eq!(
            &port.uart_tx[..],
            &[0x00, 0xAA, 0x00, 0x03, 0x02, 0x00, 0x5D, 0x9E]
        );
    }

    #[test]
    fn console_reset_does_not_stall_the_cadences() {
        let mut port = MockPort::new();
        let mut store = MemStore(None);
        let mut gw = Gateway::new(0);

        port.feed_console(b"R\n");
        run_ms(&mut gw, &mut port, &mut store, 1);
        assert!(port.console_str().contains("Resetting module"));
        assert!(!port.pin(PinId::Rstn));
        assert!(!port.pin(PinId::Mfb));

        // The line machine keeps ticking through the 500 ms hold: lifting
        // the receiver is seen within the normal debounce window.
        port.set_shk(true);
        run_ms(&mut gw, &mut port, &mut store, 30);
        assert_eq!(gw.pots.line_state(), LineState::OffHook);
        assert!(!port.pin(PinId::Rstn));

        // Hold elapses, MFB leads, RSTN releases.
        run_ms(&mut gw, &mut port, &mut store, 600);
        assert!(port.pin(PinId::Rstn));
        assert!(port.pin(PinId::Mfb));
    }

    #[test]
    fn bad_input_reports_illegal_command() {
        let mut port = MockPort::new();
        let mut store = MemStore(None);
        let mut gw = Gateway::new(0);

        port.feed_console(b"Q=3\n");
        run_ms(&mut gw, &mut port, &mut store, 1);
        assert!(port.console_str().contains("Illegal command"));
    }

    #[test]
    fn verbose_toggle_reaches_the_codec() {
        let mut port = MockPort::new();
        let mut store = MemStore(None);
        let mut gw = Gateway::new(0);

        port.feed_console(b"V=1\n");
        run_ms(&mut gw, &mut port, &mut store, 1);
        assert!(gw.codec.verbose);
        port.feed_console(b"V=0\n");
        run_ms(&mut gw, &mut port, &mut store, 1);
        assert!(!gw.codec.verbose);
    }
}
