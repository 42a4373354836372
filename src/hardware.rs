//! The hardware port: a narrow seam between the state machines and the board.
//!
//! The core never touches a peripheral register. It sees eight named GPIO
//! signals, two byte streams (the BM64 UART and the command console), a
//! monotonic millisecond clock, and the two audio-DSP hooks it depends on but
//! does not own: DTMF digit observation on the line, and supervisory tone
//! selection toward the handset.
//!
//! Tri-state matters here. The BM64 boot-strap pins express four modes from
//! two bits by distinguishing "driven low" from "left high-impedance, pulled
//! by the external resistor network", so the port carries pin *direction*
//! separately from pin *level* and the abstraction must never flatten the two.

/// The GPIO signals the gateway uses, by role rather than by package pin.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinId {
    /// BM64 reset, active low.
    Rstn,
    /// BM64 EAN boot-strap pin (tri-stateable).
    Ean,
    /// BM64 P2_0 boot-strap pin (tri-stateable).
    P20,
    /// BM64 multi-function button input; part of the power-on sequence.
    Mfb,
    /// AG1171 forward/reverse drive. Idles high; warbles during ringing.
    Fr,
    /// AG1171 ring-mode enable. High only while a ring cadence is running.
    Rm,
    /// AG1171 switch-hook sense, input. High when the receiver is lifted.
    /// No pull is configured; the board network provides it.
    Shk,
    /// Status LED; the scheduler drives it from link service state.
    Led,
}

pub const NUM_PINS: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinDir {
    Input,
    Output,
}

/// What a boot-strap pin should present to the module: a driven level, or
/// high-impedance so the external network sets it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StrapState {
    Driven(bool),
    HighZ,
}

/// Supervisory tone profiles the DSP synth can produce toward the handset.
///
/// The core decides *when* a profile is active; synthesis is the board's
/// business. Frequencies in Hz, amplitudes on a 0..1 scale.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Tone {
    None,
    Dial,
    NoService,
    ReceiverOffHook,
}

impl Tone {
    /// Component sine pairs (frequency, amplitude) for the profile.
    pub fn components(self) -> &'static [(f32, f32)] {
        match self {
            Self::None => &[],
            Self::Dial => &[(350., 0.5), (440., 0.5)],
            Self::NoService => &[(480., 0.5), (620., 0.5)],
            Self::ReceiverOffHook => {
                &[(1_400., 0.25), (2_060., 0.25), (2_450., 0.25), (2_600., 0.25)]
            }
        }
    }
}

/// DTMF detector contract: row/column bin frequencies in Hz, and the
/// normalized-energy threshold both the row and column bin must clear before
/// the decoder may report a digit. Decoding itself (Goertzel bins, windowing)
/// lives behind [`Port::dtmf_digit`].
pub const DTMF_ROWS_HZ: [f32; 4] = [697., 770., 852., 941.];
pub const DTMF_COLS_HZ: [f32; 3] = [1_209., 1_336., 1_477.];
pub const DTMF_DETECT_THRESHOLD: f32 = 0.2;

// Digit codes past 9, shared by the detector and the dial encoder.
pub const DIGIT_STAR: u8 = 10;
pub const DIGIT_POUND: u8 = 11;

/// Board abstraction consumed by every state machine.
///
/// All operations are non-blocking except [`Port::delay_ms`], which only runs
/// during the init-time module reset.
pub trait Port {
    fn gpio_read(&mut self, pin: PinId) -> bool;
    fn gpio_write(&mut self, pin: PinId, high: bool);
    fn gpio_set_direction(&mut self, pin: PinId, dir: PinDir);

    /// One byte from the BM64 UART, if any is pending.
    fn uart_read(&mut self) -> Option<u8>;
    fn uart_write(&mut self, bytes: &[u8]);

    /// One byte from the command console, if any is pending.
    fn console_read(&mut self) -> Option<u8>;
    fn console_write(&mut self, bytes: &[u8]);

    fn monotonic_ms(&self) -> u64;
    fn delay_ms(&mut self, ms: u32);

    /// Latest digit the DTMF decoder hears on the line, 0..=11 (10 ≡ '*',
    /// 11 ≡ '#'), or `None` while the line is silent or below threshold.
    fn dtmf_digit(&mut self) -> Option<u8>;

    /// Select the supervisory tone the handset should hear. Idempotent; the
    /// core only calls it on profile changes.
    fn set_tone(&mut self, tone: Tone);
}

/// `core::fmt::Write` adapter over the console, so formatted output (command
/// responses, hex dumps) needs no allocation.
pub struct ConsoleOut<'a, P: Port>(pub &'a mut P);

impl<P: Port> core::fmt::Write for ConsoleOut<'_, P> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.0.console_write(s.as_bytes());
        Ok(())
    }
}

/// BM64 boot mode, selected by the EAN/P2_0 strap pins before reset release.
///
/// Two of the four encodings leave a pin high-impedance; driving it would
/// select a different mode, which is why the port keeps direction and level
/// distinct.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootMode {
    /// Normal operation: application from flash.
    FlashApp,
    /// Flash update over the IBDK protocol.
    FlashIbdk,
    /// ROM application (flash bypass).
    RomApp,
    /// ROM IBDK test mode.
    RomIbdk,
}

impl BootMode {
    /// (EAN, P2_0) strap encoding for this mode.
    pub fn straps(self) -> (StrapState, StrapState) {
        match self {
            Self::FlashApp => (StrapState::HighZ, StrapState::Driven(false)),
            Self::FlashIbdk => (StrapState::Driven(false), StrapState::Driven(false)),
            Self::RomApp => (StrapState::HighZ, StrapState::HighZ),
            Self::RomIbdk => (StrapState::Driven(false), StrapState::HighZ),
        }
    }

    /// Present this mode on the strap pins. Must happen before the reset
    /// sequence releases RSTN.
    pub fn apply<P: Port>(self, port: &mut P) {
        let (ean, p20) = self.straps();
        apply_strap(port, PinId::Ean, ean);
        apply_strap(port, PinId::P20, p20);
    }
}

fn apply_strap<P: Port>(port: &mut P, pin: PinId, state: StrapState) {
    match state {
        StrapState::Driven(level) => {
            port.gpio_set_direction(pin, PinDir::Output);
            port.gpio_write(pin, level);
        }
        StrapState::HighZ => port.gpio_set_direction(pin, PinDir::Input),
    }
}

/// RSTN must stay low at least this long, with MFB held low, before the
/// power-on handshake.
pub const RESET_HOLD_MS: u32 = 500;

/// MFB leads RSTN release by this much.
pub const RESET_MFB_LEAD_MS: u32 = 1;

/// Hardware reset of the BM64: assert RSTN with MFB low, hold, raise MFB,
/// wait 1 ms, release RSTN. Blocking; init only. A reset requested at
/// runtime goes through [`ResetSequencer`] so the loop keeps ticking.
pub fn reset_module<P: Port>(port: &mut P) {
    port.gpio_write(PinId::Rstn, false);
    port.gpio_write(PinId::Mfb, false);
    port.delay_ms(RESET_HOLD_MS);
    port.gpio_write(PinId::Mfb, true);
    port.delay_ms(RESET_MFB_LEAD_MS);
    port.gpio_write(PinId::Rstn, true);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ResetPhase {
    Idle,
    /// RSTN and MFB held low for [`RESET_HOLD_MS`].
    Hold { since: u64 },
    /// MFB raised; RSTN follows after [`RESET_MFB_LEAD_MS`].
    Release { since: u64 },
}

/// The same RSTN/MFB sequence as [`reset_module`], paced by the monotonic
/// clock instead of a blocking delay, for resets requested over the console
/// while the gateway is running.
pub struct ResetSequencer {
    phase: ResetPhase,
}

impl ResetSequencer {
    pub fn new() -> Self {
        Self {
            phase: ResetPhase::Idle,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.phase != ResetPhase::Idle
    }

    /// Assert RSTN with MFB low and start the hold. No-op while a sequence
    /// is already running.
    pub fn start<P: Port>(&mut self, port: &mut P) {
        if self.phase == ResetPhase::Idle {
            port.gpio_write(PinId::Rstn, false);
            port.gpio_write(PinId::Mfb, false);
            self.phase = ResetPhase::Hold {
                since: port.monotonic_ms(),
            };
        }
    }

    /// Advance the sequence; call once per loop pass.
    pub fn run<P: Port>(&mut self, port: &mut P) {
        let now = port.monotonic_ms();
        match self.phase {
            ResetPhase::Idle => {}
            ResetPhase::Hold { since } => {
                if now.wrapping_sub(since) >= RESET_HOLD_MS as u64 {
                    port.gpio_write(PinId::Mfb, true);
                    self.phase = ResetPhase::Release { since: now };
                }
            }
            ResetPhase::Release { since } => {
                if now.wrapping_sub(since) >= RESET_MFB_LEAD_MS as u64 {
                    port.gpio_write(PinId::Rstn, true);
                    self.phase = ResetPhase::Idle;
                }
            }
        }
    }
}
