//! Firmware entry: bring up clocks and pins, load the pairing slot, reset the
//! BM64 into flash-application mode, then run the gateway loop forever.

#![no_main]
#![no_std]

use cfg_if::cfg_if;
use cortex_m::delay::Delay;
use cortex_m::peripheral::NVIC;
use cortex_m_rt::entry;
use defmt::println;
use defmt_rtt as _;
use panic_probe as _;

use hal::{
    clocks::Clocks,
    flash::Flash,
    pac,
    timer::{Timer, TimerInterrupt},
};

use blue_pot::board::{Board, FlashStore};
use blue_pot::cfg_storage;
use blue_pot::hardware::{reset_module, BootMode, Port};
use blue_pot::scheduler::Gateway;

#[entry]
fn main() -> ! {
    let cp = cortex_m::Peripherals::take().unwrap();
    let dp = pac::Peripherals::take().unwrap();

    let clock_cfg = Clocks::default();
    clock_cfg.setup().unwrap();
    println!("Clocks setup successfully");

    let delay = Delay::new(cp.SYST, clock_cfg.systick());

    // 1 kHz update timer feeds the monotonic millisecond clock.
    let mut tick_timer = Timer::new_tim15(dp.TIM15, 1_000., Default::default(), &clock_cfg);
    tick_timer.enable_interrupt(TimerInterrupt::Update);
    cfg_if! {
        if #[cfg(feature = "h7")] {
            unsafe { NVIC::unmask(pac::Interrupt::TIM15) };
        } else {
            unsafe { NVIC::unmask(pac::Interrupt::TIM1_BRK_TIM15) };
        }
    }
    tick_timer.enable();

    let mut board = Board::new(dp.USART1, dp.USART2, delay, &clock_cfg);
    let mut store = FlashStore::new(Flash::new(dp.FLASH));

    let slot = cfg_storage::load_or_default(&mut store);
    println!("Blue POT starting; pairing slot {}", slot);

    // Straps first, then the (blocking) reset sequence releases the module
    // into flash-application mode.
    BootMode::FlashApp.apply(&mut board);
    reset_module(&mut board);

    board.console_write(b"Blue POT ready\r\n");

    let mut gateway = Gateway::new(slot);
    loop {
        gateway.poll(&mut board, &mut store);
    }
}
