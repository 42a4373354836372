//! STM32 binding of the hardware port.
//!
//! Pin map (all control signals on port B, UARTs on port A):
//!
//! | Signal | Pin  | Notes |
//! |--------|------|-------|
//! | RSTN   | PB0  | BM64 reset, active low |
//! | EAN    | PB1  | boot strap, tri-stateable |
//! | P2_0   | PB2  | boot strap, tri-stateable |
//! | SHK    | PB4  | AG1171 hook sense, input (board provides the divider) |
//! | FR     | PB5  | AG1171 forward/reverse |
//! | RM     | PB6  | AG1171 ring mode |
//! | LED    | PB7  | status |
//! | MFB    | PB12 | BM64 multi-function button |
//! | BM64 UART | USART2, PA2/PA3 | 115_200 |
//! | console   | USART1, PA9/PA10 | 115_200 |
//!
//! The DTMF decoder and tone synth are not fitted on this board revision:
//! the decoder port reports silence and tone selections go to the debug log.

use core::cell::Cell;

use cfg_if::cfg_if;
use cortex_m::delay::Delay;
use cortex_m::interrupt::{free, Mutex};
use hal::{
    flash::{Bank, Flash},
    gpio::{Pin, PinMode, Port as GpioPort},
    pac::{self, interrupt, USART1, USART2},
    usart::Usart,
};

use crate::cfg_storage::{decode_record, encode_record, SlotStore, RECORD_SIZE};
use crate::hardware::{PinDir, PinId, Port, Tone};

cfg_if! {
    if #[cfg(feature = "h7")] {
        // H723/H743: 8 sectors of 128kb; the last one holds the slot record.
        const FLASH_CFG_SECTOR: usize = 7;
    } else {
        // G47x: single-bank, 128 pages of 4kb.
        const FLASH_CFG_PAGE: usize = 126;
    }
}

pub const BM64_BAUD: u32 = 115_200;
pub const CONSOLE_BAUD: u32 = 115_200;

/// Millisecond counter, bumped from the TIM15 update ISR.
static TICK_MS: Mutex<Cell<u64>> = Mutex::new(Cell::new(0));

pub fn millis() -> u64 {
    free(|cs| TICK_MS.borrow(cs).get())
}

cfg_if! {
    if #[cfg(feature = "h7")] {
        #[interrupt]
        fn TIM15() {
            unsafe { (*pac::TIM15::ptr()).sr.modify(|_, w| w.uif().clear_bit()) }
            free(|cs| {
                let t = TICK_MS.borrow(cs);
                t.set(t.get().wrapping_add(1));
            });
        }
    } else {
        #[interrupt]
        fn TIM1_BRK_TIM15() {
            unsafe { (*pac::TIM15::ptr()).sr.modify(|_, w| w.uif().clear_bit()) }
            free(|cs| {
                let t = TICK_MS.borrow(cs);
                t.set(t.get().wrapping_add(1));
            });
        }
    }
}

pub struct Board {
    rstn: Pin,
    ean: Pin,
    p2_0: Pin,
    mfb: Pin,
    fr: Pin,
    rm: Pin,
    shk: Pin,
    led: Pin,
    bm64_uart: Usart<USART2>,
    console_uart: Usart<USART1>,
    delay: Delay,
    tone: Tone,
}

impl Board {
    /// Claim pins and UARTs. Clocks must already be configured; the TIM15
    /// millisecond tick is the caller's to start.
    pub fn new(
        usart1: USART1,
        usart2: USART2,
        delay: Delay,
        clock_cfg: &hal::clocks::Clocks,
    ) -> Self {
        // BM64 link on USART2.
        let _bm64_tx = Pin::new(GpioPort::A, 2, PinMode::Alt(7));
        let _bm64_rx = Pin::new(GpioPort::A, 3, PinMode::Alt(7));
        // Console on USART1.
        let _console_tx = Pin::new(GpioPort::A, 9, PinMode::Alt(7));
        let _console_rx = Pin::new(GpioPort::A, 10, PinMode::Alt(7));

        let mut rstn = Pin::new(GpioPort::B, 0, PinMode::Output);
        // Hold the module in reset until the boot straps are presented.
        rstn.set_low();
        let ean = Pin::new(GpioPort::B, 1, PinMode::Output);
        let p2_0 = Pin::new(GpioPort::B, 2, PinMode::Output);
        let shk = Pin::new(GpioPort::B, 4, PinMode::Input);
        let mut fr = Pin::new(GpioPort::B, 5, PinMode::Output);
        fr.set_high();
        let mut rm = Pin::new(GpioPort::B, 6, PinMode::Output);
        rm.set_low();
        let mut led = Pin::new(GpioPort::B, 7, PinMode::Output);
        led.set_low();
        let mut mfb = Pin::new(GpioPort::B, 12, PinMode::Output);
        mfb.set_low();

        let bm64_uart = Usart::new(usart2, BM64_BAUD, Default::default(), clock_cfg);
        let console_uart = Usart::new(usart1, CONSOLE_BAUD, Default::default(), clock_cfg);

        Self {
            rstn,
            ean,
            p2_0,
            mfb,
            fr,
            rm,
            shk,
            led,
            bm64_uart,
            console_uart,
            delay,
            tone: Tone::None,
        }
    }

    fn pin_mut(&mut self, pin: PinId) -> &mut Pin {
        match pin {
            PinId::Rstn => &mut self.rstn,
            PinId::Ean => &mut self.ean,
            PinId::P20 => &mut self.p2_0,
            PinId::Mfb => &mut self.mfb,
            PinId::Fr => &mut self.fr,
            PinId::Rm => &mut self.rm,
            PinId::Shk => &mut self.shk,
            PinId::Led => &mut self.led,
        }
    }
}

impl Port for Board {
    fn gpio_read(&mut self, pin: PinId) -> bool {
        self.pin_mut(pin).is_high()
    }

    fn gpio_write(&mut self, pin: PinId, high: bool) {
        let pin = self.pin_mut(pin);
        if high {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }

    fn gpio_set_direction(&mut self, pin: PinId, dir: PinDir) {
        // Only the boot straps flip direction at runtime; input mode leaves
        // the pin floating for the external network to pull.
        let mode = match dir {
            PinDir::Input => 0b00,
            PinDir::Output => 0b01,
        };
        match pin {
            PinId::Ean => unsafe {
                (*pac::GPIOB::ptr()).moder.modify(|_, w| w.moder1().bits(mode));
            },
            PinId::P20 => unsafe {
                (*pac::GPIOB::ptr()).moder.modify(|_, w| w.moder2().bits(mode));
            },
            _ => {}
        }
    }

    fn uart_read(&mut self) -> Option<u8> {
        let regs = unsafe { &(*pac::USART2::ptr()) };
        if regs.isr.read().rxne().bit_is_set() {
            Some(regs.rdr.read().rdr().bits() as u8)
        } else {
            None
        }
    }

    fn uart_write(&mut self, bytes: &[u8]) {
        self.bm64_uart.write(bytes).ok();
    }

    fn console_read(&mut self) -> Option<u8> {
        let regs = unsafe { &(*pac::USART1::ptr()) };
        if regs.isr.read().rxne().bit_is_set() {
            Some(regs.rdr.read().rdr().bits() as u8)
        } else {
            None
        }
    }

    fn console_write(&mut self, bytes: &[u8]) {
        self.console_uart.write(bytes).ok();
    }

    fn monotonic_ms(&self) -> u64 {
        millis()
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    fn dtmf_digit(&mut self) -> Option<u8> {
        // Decoder not fitted; the line dials by rotary pulses only.
        None
    }

    fn set_tone(&mut self, tone: Tone) {
        if tone != self.tone {
            defmt::println!("Tone: {}", tone);
            self.tone = tone;
        }
    }
}

/// Slot record on internal flash: one page, rewritten whole on every save,
/// no wear levelling.
pub struct FlashStore {
    flash: Flash,
}

impl FlashStore {
    pub fn new(flash: Flash) -> Self {
        Self { flash }
    }
}

impl SlotStore for FlashStore {
    fn load_slot(&mut self) -> Option<u8> {
        let mut buf = [0u8; RECORD_SIZE];
        cfg_if! {
            if #[cfg(feature = "h7")] {
                self.flash.read(Bank::B1, FLASH_CFG_SECTOR, 0, &mut buf);
            } else {
                self.flash.read(Bank::B1, FLASH_CFG_PAGE, 0, &mut buf);
            }
        }
        decode_record(&buf)
    }

    fn save_slot(&mut self, slot: u8) {
        let record = encode_record(slot);
        cfg_if! {
            if #[cfg(feature = "h7")] {
                self.flash
                    .erase_write_sector(Bank::B1, FLASH_CFG_SECTOR, &record)
                    .ok();
            } else {
                self.flash
                    .erase_write_page(Bank::B1, FLASH_CFG_PAGE, &record)
                    .ok();
            }
        }
    }
}
