//! PIT-driven tick source.
//!
//! Ticks at [`TICK_HZ`] Hz; the scheduler (4.D) and AMC's `AwaitTimestamp`
//! wake check both key off [`uptime_ms`].

use core::sync::atomic::{AtomicU64, Ordering};

/// Ticks per second. One tick = one millisecond, which is also the unit
/// `blocked_info.wake_timestamp_ms` (spec section 3) is expressed in.
pub const TICK_HZ: u32 = 1000;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks elapsed since `setup_timer` was called.
pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds elapsed since `setup_timer` was called.
pub fn uptime_ms() -> u64 {
    get_ticks() * (1000 / TICK_HZ as u64).max(1)
}

/// Called from the timer interrupt handler once per tick.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::timer_tick();
}

/// Program the PIT (8253/8254) for periodic interrupts at `TICK_HZ`.
pub fn setup_timer() {
    const PIT_FREQUENCY: u32 = 1_193_182;
    let divisor = (PIT_FREQUENCY / TICK_HZ).max(1);

    // SAFETY: ports 0x43 (command) and 0x40 (channel 0 data) are the
    // standard PIT I/O addresses. The ICW sequence below (mode 3, lobyte/
    // hibyte access) is the documented way to reprogram channel 0 and is
    // only run once, before interrupts are unmasked.
    unsafe {
        use x86_64::instructions::port::Port;
        let mut cmd: Port<u8> = Port::new(0x43);
        let mut data: Port<u8> = Port::new(0x40);
        cmd.write(0x36u8);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }

    log::info!("timer: PIT programmed for {} Hz", TICK_HZ);
}
