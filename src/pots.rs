//! POTS line state machine: hook supervision, ring cadence, dial capture and
//! supervisory tones, evaluated every 10 ms.
//!
//! The AG1171 SLIC gives us three wires: SHK (high while the receiver is
//! lifted), RM (ring mode enable) and FR (forward/reverse, warbled at 25 Hz
//! to ring the bell). Everything interesting on an analog line is timing:
//! rotary dials hang up and come back 10 times a second, so a "hang-up" is
//! only real after half a second of confirmed on-hook, and ring bursts must
//! keep their 1 s on / 3 s off cadence across handset events.
//!
//! Toward the Bluetooth side the line exposes two single-shot edge events
//! (`hook_change`, `digit_dialed`) and accepts three level directives
//! (`set_in_service`, `set_in_call`, `set_ring`).

use crate::hardware::{PinId, Port, Tone};

// One evaluation tick is 10 ms; every window below is in ticks.

/// Confirmed on-hook time before a provisional hang-up becomes real. Rotary
/// pulse breaks are far shorter than this.
pub const HANGUP_CONFIRM_TICKS: u32 = 50;

/// Half of one 25 Hz warble cycle on FR.
const RING_HALF_CYCLE_TICKS: u32 = 2;
/// Warble cycles per burst: 25 cycles at 25 Hz is the 1 s on-phase.
const RING_ON_CYCLES: u32 = 25;
/// Silent gap between bursts, 3 s.
const RING_BETWEEN_TICKS: u32 = 300;

/// Longest break or make a rotary pulse train may contain, 100 ms.
const PULSE_WINDOW_TICKS: u32 = 10;
/// Ten pulses encode the digit 0.
const ROTARY_PULSES_MAX: u8 = 10;

/// Stable detection time before a DTMF digit qualifies, and the silence that
/// must follow before it is emitted. 30 ms each.
const DTMF_QUALIFY_TICKS: u32 = 3;
const DTMF_SILENCE_TICKS: u32 = 3;

/// Receiver-off-hook window: 60 s off hook without a call brings the howler.
pub const OFF_HOOK_TIMEOUT_TICKS: u32 = 6_000;

// Warble cadences for the two intermittent tones.
const NO_SERVICE_ON_TICKS: u32 = 30; // 300 ms
const NO_SERVICE_OFF_TICKS: u32 = 20; // 200 ms
const HOWLER_ON_TICKS: u32 = 10; // 100 ms
const HOWLER_OFF_TICKS: u32 = 10;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LineState {
    OnHook,
    OffHook,
    /// Debounce limbo: on-hook reading that may still be a rotary break.
    OnHookProvisional,
    Ringing,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RingState {
    Idle,
    PulseOn,
    PulseOff,
    Between,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum DialState {
    Idle,
    Break,
    Make,
    DtmfOn,
    DtmfOff,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ToneState {
    /// Line is on hook; nothing to say.
    Idle,
    /// Off hook, deliberately silent (answered call, post-digit).
    Off,
    Dial,
    NoServiceOn,
    NoServiceOff,
    OffHookOn,
    OffHookOff,
}

pub struct PotsLine {
    state: LineState,

    // Hook debounce: two consecutive raw samples must agree before the
    // latched level moves.
    prev_raw_off_hook: bool,
    cur_off_hook: bool,
    provisional_ticks: u32,
    hook_change: Option<bool>,

    ring: RingState,
    ring_request: bool,
    ring_half_ticks: u32,
    ring_cycles: u32,
    ring_between_ticks: u32,
    fr: bool,
    rm: bool,

    dial: DialState,
    dial_window_ticks: u32,
    pulse_count: u8,
    prev_dtmf_digit: u8,
    dtmf_ticks: u32,
    digit_dialed: Option<u8>,

    tone: ToneState,
    tone_ticks: u32,
    off_hook_ticks: u32,
    applied_tone: Tone,

    in_service: bool,
    in_call: bool,
}

impl PotsLine {
    pub fn new() -> Self {
        Self {
            state: LineState::OnHook,
            prev_raw_off_hook: false,
            cur_off_hook: false,
            provisional_ticks: 0,
            hook_change: None,
            ring: RingState::Idle,
            ring_request: false,
            ring_half_ticks: 0,
            ring_cycles: 0,
            ring_between_ticks: 0,
            fr: true,
            rm: false,
            dial: DialState::Idle,
            dial_window_ticks: 0,
            pulse_count: 0,
            prev_dtmf_digit: 0,
            dtmf_ticks: 0,
            digit_dialed: None,
            tone: ToneState::Idle,
            tone_ticks: 0,
            off_hook_ticks: 0,
            applied_tone: Tone::None,
            in_service: false,
            in_call: false,
        }
    }

    pub fn line_state(&self) -> LineState {
        self.state
    }

    pub fn ring_state(&self) -> RingState {
        self.ring
    }

    /// Single-shot off/on-hook edge toward the link machine; reading consumes
    /// it. Rotary pulse breaks never surface here.
    pub fn take_hook_change(&mut self) -> Option<bool> {
        self.hook_change.take()
    }

    /// Single-shot dialed digit (0..=11), rotary or DTMF.
    pub fn take_digit(&mut self) -> Option<u8> {
        self.digit_dialed.take()
    }

    pub fn set_in_service(&mut self, in_service: bool) {
        self.in_service = in_service;
    }

    pub fn set_in_call(&mut self, in_call: bool) {
        self.in_call = in_call;
        if in_call {
            // A live call silences supervision and parks the howler window.
            self.tone = ToneState::Off;
            self.off_hook_ticks = 0;
        }
    }

    pub fn set_ring(&mut self, ring: bool) {
        self.ring_request = ring;
    }

    /// One 10 ms evaluation pass.
    pub fn tick<P: Port>(&mut self, port: &mut P) {
        let raw = port.gpio_read(PinId::Shk);
        let edge = self.debounce(raw);
        let dtmf = port.dtmf_digit();

        let digit = self.run_dialer(edge, dtmf);
        if let Some(d) = digit {
            self.digit_dialed = Some(d);
        }
        self.run_ringer(port);
        let (surfaced, answered) = self.run_phone(edge);
        self.run_tone(port, surfaced, answered, digit.is_some());
    }

    fn debounce(&mut self, raw: bool) -> Option<bool> {
        let mut edge = None;
        if raw == self.prev_raw_off_hook && raw != self.cur_off_hook {
            self.cur_off_hook = raw;
            edge = Some(raw);
        }
        self.prev_raw_off_hook = raw;
        edge
    }

    fn run_dialer(&mut self, edge: Option<bool>, dtmf: Option<u8>) -> Option<u8> {
        match self.dial {
            DialState::Idle => {
                if edge == Some(false) {
                    self.dial = DialState::Break;
                    self.dial_window_ticks = 0;
                    self.pulse_count = 0;
                } else if self.state != LineState::OnHook {
                    if let Some(d) = dtmf {
                        self.dial = DialState::DtmfOn;
                        self.prev_dtmf_digit = d;
                        self.dtmf_ticks = 0;
                    }
                }
            }
            DialState::Break => {
                if edge == Some(true) {
                    if self.pulse_count < ROTARY_PULSES_MAX {
                        self.pulse_count += 1;
                    }
                    self.dial = DialState::Make;
                    self.dial_window_ticks = 0;
                } else {
                    self.dial_window_ticks += 1;
                    if self.dial_window_ticks > PULSE_WINDOW_TICKS {
                        // Too long for a pulse: this is a hang-up in progress,
                        // and the hook machine owns it from here.
                        self.dial = DialState::Idle;
                    }
                }
            }
            DialState::Make => {
                if edge == Some(false) {
                    self.dial = DialState::Break;
                    self.dial_window_ticks = 0;
                } else {
                    self.dial_window_ticks += 1;
                    if self.dial_window_ticks > PULSE_WINDOW_TICKS {
                        self.dial = DialState::Idle;
                        let d = if self.pulse_count >= ROTARY_PULSES_MAX {
                            0
                        } else {
                            self.pulse_count
                        };
                        return Some(d);
                    }
                }
            }
            DialState::DtmfOn => match dtmf {
                Some(d) if d == self.prev_dtmf_digit => {
                    self.dtmf_ticks += 1;
                    if self.dtmf_ticks >= DTMF_QUALIFY_TICKS {
                        self.dial = DialState::DtmfOff;
                        self.dtmf_ticks = 0;
                    }
                }
                // Changed or vanished mid-qualification: not a digit.
                _ => self.dial = DialState::Idle,
            },
            DialState::DtmfOff => match dtmf {
                None => {
                    self.dtmf_ticks += 1;
                    if self.dtmf_ticks >= DTMF_SILENCE_TICKS {
                        self.dial = DialState::Idle;
                        return Some(self.prev_dtmf_digit);
                    }
                }
                Some(d) if d == self.prev_dtmf_digit => {
                    // Key still held; keep waiting for silence.
                    self.dtmf_ticks = 0;
                }
                Some(d) => {
                    self.dial = DialState::DtmfOn;
                    self.prev_dtmf_digit = d;
                    self.dtmf_ticks = 0;
                }
            },
        }
        None
    }

    fn run_ringer<P: Port>(&mut self, port: &mut P) {
        if self.ring_request {
            if self.ring == RingState::Idle && self.state == LineState::OnHook {
                self.ring = RingState::PulseOn;
                self.rm = true;
                self.fr = false;
                self.ring_half_ticks = 0;
                self.ring_cycles = 0;
            }
        } else if self.ring != RingState::Idle {
            self.stop_ring();
        }

        match self.ring {
            RingState::Idle => {}
            RingState::PulseOn => {
                self.ring_half_ticks += 1;
                if self.ring_half_ticks >= RING_HALF_CYCLE_TICKS {
                    self.fr = true;
                    self.ring_half_ticks = 0;
                    self.ring = RingState::PulseOff;
                }
            }
            RingState::PulseOff => {
                self.ring_half_ticks += 1;
                if self.ring_half_ticks >= RING_HALF_CYCLE_TICKS {
                    self.fr = false;
                    self.ring_half_ticks = 0;
                    self.ring_cycles += 1;
                    if self.ring_cycles >= RING_ON_CYCLES {
                        self.ring = RingState::Between;
                        self.ring_between_ticks = 0;
                    } else {
                        self.ring = RingState::PulseOn;
                    }
                }
            }
            RingState::Between => {
                self.ring_between_ticks += 1;
                if self.ring_between_ticks >= RING_BETWEEN_TICKS {
                    self.ring = RingState::PulseOn;
                    self.ring_cycles = 0;
                    self.ring_half_ticks = 0;
                }
            }
        }

        port.gpio_write(PinId::Fr, self.fr);
        port.gpio_write(PinId::Rm, self.rm);
    }

    fn stop_ring(&mut self) {
        self.ring = RingState::Idle;
        self.fr = true;
        self.rm = false;
    }

    /// Phone state machine proper. Returns the edge surfaced toward the link
    /// machine this tick (if any) and whether it answered a ring.
    ///
    /// Pin levels adjusted here (a ring stopped by an off-hook edge) reach the
    /// SLIC on the next tick's ringer pass; the tail is one tick long.
    fn run_phone(&mut self, edge: Option<bool>) -> (Option<bool>, bool) {
        let mut surfaced = None;
        let mut answered = false;
        match self.state {
            LineState::OnHook => {
                if edge == Some(true) {
                    self.state = LineState::OffHook;
                    surfaced = Some(true);
                } else if self.ring != RingState::Idle {
                    self.state = LineState::Ringing;
                }
            }
            LineState::OffHook => {
                if edge == Some(false) {
                    self.state = LineState::OnHookProvisional;
                    self.provisional_ticks = 0;
                }
            }
            LineState::OnHookProvisional => {
                if edge == Some(true) {
                    // A rotary break ending, not a hang-up. No edge surfaces.
                    self.state = LineState::OffHook;
                } else {
                    self.provisional_ticks += 1;
                    if self.provisional_ticks >= HANGUP_CONFIRM_TICKS {
                        self.state = LineState::OnHook;
                        surfaced = Some(false);
                    }
                }
            }
            LineState::Ringing => {
                if edge == Some(true) {
                    self.stop_ring();
                }
                if self.ring == RingState::Idle {
                    if self.cur_off_hook {
                        self.state = LineState::OffHook;
                        surfaced = Some(true);
                        answered = true;
                    } else {
                        self.state = LineState::OnHook;
                    }
                }
            }
        }
        if self.state != LineState::Ringing && self.ring != RingState::Idle
            && self.state != LineState::OnHook
        {
            // Ring may not outlive a line that has left OnHook/Ringing.
            self.stop_ring();
        }
        if surfaced.is_some() {
            self.hook_change = surfaced;
        }
        (surfaced, answered)
    }

    fn run_tone<P: Port>(
        &mut self,
        port: &mut P,
        surfaced: Option<bool>,
        answered: bool,
        digit: bool,
    ) {
        match surfaced {
            Some(true) => {
                self.off_hook_ticks = 0;
                self.tone_ticks = 0;
                self.tone = if answered || self.in_call {
                    ToneState::Off
                } else if self.in_service {
                    ToneState::Dial
                } else {
                    ToneState::NoServiceOn
                };
            }
            Some(false) => {
                self.tone = ToneState::Idle;
                self.off_hook_ticks = 0;
            }
            None => {}
        }

        if digit {
            self.tone = ToneState::Off;
        }
        if self.in_call && self.tone != ToneState::Idle {
            self.tone = ToneState::Off;
        }

        // Receiver left off hook with no call: start howling after 60 s.
        if self.state == LineState::OffHook
            && !self.in_call
            && !matches!(self.tone, ToneState::OffHookOn | ToneState::OffHookOff)
        {
            self.off_hook_ticks += 1;
            if self.off_hook_ticks >= OFF_HOOK_TIMEOUT_TICKS {
                self.tone = ToneState::OffHookOn;
                self.tone_ticks = 0;
            }
        }

        match self.tone {
            ToneState::NoServiceOn => {
                self.tone_ticks += 1;
                if self.tone_ticks >= NO_SERVICE_ON_TICKS {
                    self.tone = ToneState::NoServiceOff;
                    self.tone_ticks = 0;
                }
            }
            ToneState::NoServiceOff => {
                self.tone_ticks += 1;
                if self.tone_ticks >= NO_SERVICE_OFF_TICKS {
                    self.tone = ToneState::NoServiceOn;
                    self.tone_ticks = 0;
                }
            }
            ToneState::OffHookOn => {
                self.tone_ticks += 1;
                if self.tone_ticks >= HOWLER_ON_TICKS {
                    self.tone = ToneState::OffHookOff;
                    self.tone_ticks = 0;
                }
            }
            ToneState::OffHookOff => {
                self.tone_ticks += 1;
                if self.tone_ticks >= HOWLER_OFF_TICKS {
                    self.tone = ToneState::OffHookOn;
                    self.tone_ticks = 0;
                }
            }
            _ => {}
        }

        let profile = match self.tone {
            ToneState::Dial => Tone::Dial,
            ToneState::NoServiceOn => Tone::NoService,
            ToneState::OffHookOn => Tone::ReceiverOffHook,
            _ => Tone::None,
        };
        if profile != self.applied_tone {
            port.set_tone(profile);
            self.applied_tone = profile;
        }
    }
}
