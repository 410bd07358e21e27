#![no_std]
#![no_main]

//! Safety watchdog and I/O mediation firmware.
//!
//! Sits between the single-board host computer (serial line, 9600 8N1) and
//! the power-control cabinet: keeps the watchdog relay pulsing while the
//! host proves liveness, latches every fault until hardware reset, and
//! mediates output/input access through the framed line protocol.
//!
//! Two execution contexts share the state, like the timer-ISR/main split of
//! the original board: the 1 kHz cyclic pass in `main` owns the pins, the
//! protocol task owns the UART, and the watchdog triple sits behind a
//! critical-section mutex.

use core::cell::RefCell;

use defmt::*;
use defmt_rtt as _;
use panic_probe as _;

use embassy_executor::Spawner;
use embassy_stm32 as stm32;
use embassy_stm32::bind_interrupts;
use embassy_stm32::gpio::{Flex, Input, Level, Output, Pull, Speed};
use embassy_stm32::mode::Async as UartAsync;
use embassy_stm32::usart::{
    Config as UartConfig, DataBits as UartDataBits, Parity as UartParity, RingBufferedUartRx,
    StopBits as UartStopBits, Uart, UartTx,
};
use embassy_sync::blocking_mutex::{Mutex as BlockingMutex, raw::CriticalSectionRawMutex};
use embassy_time::{Duration, Instant, Timer};
use static_cell::StaticCell;

use relayguard_core::cyclic::{SUPPORTED_INPUTS, SUPPORTED_OUTPUTS};
use relayguard_core::watchdog::TICK_MS;
use relayguard_core::{
    CyclicIo, DiagStore, Guard, GuardPort, IoStore, TickSource, WatchdogState, stop_and_retrigger,
};
use relayguard_protocol::{
    DiagReport, Engine, LineBuffer, LineEvent, OutputReply, Station, WatchdogReply,
};

bind_interrupts!(struct Irqs {
    USART3 => stm32::usart::InterruptHandler<stm32::peripherals::USART3>;
});

/// Version token reported by the `V` command; injected by build.rs.
const FW_VERSION: &str = env!("RELAYGUARD_FW_VERSION");

/// Host link speed as wired in the cabinet.
const UART_BAUD: u32 = 9600;

// --- Shared state ------------------------------------------------------------
//
// The (state, counter, reset_lock) triple is mutated from both contexts, so
// every access goes through the critical-section mutex. The output/input
// slots and the diagnosis cells are single words and stay lock-free.
static GUARD: BlockingMutex<CriticalSectionRawMutex, RefCell<Guard>> =
    BlockingMutex::new(RefCell::new(Guard::new()));
static IO: IoStore = IoStore::new();
static DIAG: DiagStore = DiagStore::new();

static UART_RX_DMA_BUF: StaticCell<[u8; 256]> = StaticCell::new();

fn timestamp_ms() -> u64 {
    Instant::now().as_millis()
}

defmt::timestamp!("{=u64:ms}", timestamp_ms());

fn level(high: bool) -> Level {
    if high { Level::High } else { Level::Low }
}

// --- Board pins --------------------------------------------------------------

struct BoardPort {
    /// Host-settable outputs; PA0..PA2 carry the pulsed loads.
    outputs: [Output<'static>; SUPPORTED_OUTPUTS],
    relay: Output<'static>,
    /// Tri-state while unlocked, push-pull HIGH while locking the host
    /// reset line.
    reset_lock: Flex<'static>,
    led: Output<'static>,
    /// PB4 doubles as the watchdog readback.
    inputs: [Input<'static>; SUPPORTED_INPUTS],
}

impl GuardPort for BoardPort {
    fn write_output(&mut self, index: usize, high: bool) {
        if let Some(pin) = self.outputs.get_mut(index) {
            pin.set_level(level(high));
        }
    }

    fn write_relay(&mut self, high: bool) {
        self.relay.set_level(level(high));
    }

    fn write_led(&mut self, high: bool) {
        self.led.set_level(level(high));
    }

    fn read_input(&mut self, index: usize) -> bool {
        self.inputs.get(index).map(|pin| pin.is_high()).unwrap_or(false)
    }

    fn lock_reset(&mut self) {
        // level first, then the driver: the reset line must never see a
        // LOW glitch from the handover
        self.reset_lock.set_high();
        self.reset_lock.set_as_output(Speed::Low);
    }

    fn release_reset(&mut self) {
        // pull the level down while still driving (pull-up off), then hand
        // the pin back to tri-state
        self.reset_lock.set_low();
        self.reset_lock.set_as_input(Pull::None);
    }
}

// 1 ms time base for the retrigger burst, polled instead of awaited so the
// burst can out-pace the regular tick cadence.
struct MsTicks {
    next: Instant,
}

impl MsTicks {
    fn new() -> Self {
        Self {
            next: Instant::now() + Duration::from_millis(1),
        }
    }
}

impl TickSource for MsTicks {
    fn tick_elapsed(&mut self) -> bool {
        if Instant::now() >= self.next {
            self.next += Duration::from_millis(1);
            true
        } else {
            false
        }
    }
}

// --- Protocol side -----------------------------------------------------------

// Wires the protocol engine to the shared stores.
struct GuardStation;

impl Station for GuardStation {
    fn version(&mut self) -> &'static str {
        FW_VERSION
    }

    fn set_watchdog(&mut self, run: bool) -> WatchdogReply {
        let report = GUARD.lock(|guard| guard.borrow_mut().set(run, &DIAG));
        if !run && report.old_running {
            warn!("host cleared a running watchdog");
        }
        WatchdogReply {
            old_running: report.old_running,
            new_running: report.new_running,
            lock_required: report.lock_required,
        }
    }

    fn set_output(&mut self, index: u8, on: bool) -> OutputReply {
        let index = index as usize;
        let old_state = IO.set_output(index, on);
        OutputReply {
            old_state,
            new_state: IO.output(index),
        }
    }

    fn read_input(&mut self, index: u8) -> bool {
        IO.input(index as usize)
    }

    fn diagnoses(&mut self) -> DiagReport {
        DiagReport {
            diagnoses: DIAG.take_diagnoses(),
            first_error: DIAG.take_error(),
            executed_tests: DIAG.take_executed_tests(),
        }
    }

    fn request_test(&mut self) -> bool {
        GUARD.lock(|guard| guard.borrow_mut().request_self_test())
    }
}

#[embassy_executor::task]
async fn protocol_task(mut rx: RingBufferedUartRx<'static>, mut tx: UartTx<'static, UartAsync>) {
    info!("protocol task starting ({} baud)", UART_BAUD);

    let mut line = LineBuffer::new();
    let mut engine = Engine::new();
    let mut station = GuardStation;
    let mut buf = [0u8; 64];

    loop {
        match rx.read(&mut buf).await {
            Ok(n) if n > 0 => {
                for &byte in &buf[..n] {
                    let response = match line.push(byte) {
                        Some(LineEvent::Frame(frame)) => Some(engine.handle(&frame, &mut station)),
                        Some(LineEvent::Overflow) => {
                            warn!("request overflow, resynchronised on terminator");
                            Some(engine.overflow_response())
                        }
                        None => None,
                    };
                    if let Some(response) = response {
                        if tx.write(&response).await.is_err() {
                            warn!("uart tx error, response dropped");
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                // DMA ring overrun or line noise; drop the partial frame so
                // the next terminator starts clean
                warn!("uart rx error: {}", err);
                line.reset();
            }
        }
    }
}

// --- Cyclic side -------------------------------------------------------------

#[embassy_executor::main]
async fn main(spawner: Spawner) -> ! {
    let p = stm32::init(stm32::Config::default());
    info!("relayguard {} alive", FW_VERSION);

    // Relay and outputs boot LOW (de-energised), LED boots HIGH.
    let outputs = [
        Output::new(p.PA0, Level::Low, Speed::Low),
        Output::new(p.PA1, Level::Low, Speed::Low),
        Output::new(p.PA2, Level::Low, Speed::Low),
        Output::new(p.PA3, Level::Low, Speed::Low),
        Output::new(p.PA4, Level::Low, Speed::Low),
        Output::new(p.PA5, Level::Low, Speed::Low),
        Output::new(p.PA6, Level::Low, Speed::Low),
    ];
    let relay = Output::new(p.PB0, Level::Low, Speed::Low);
    let led = Output::new(p.PB3, Level::High, Speed::Low);
    let inputs = [
        Input::new(p.PB4, Pull::None),
        Input::new(p.PB5, Pull::None),
        Input::new(p.PB6, Pull::None),
        Input::new(p.PB7, Pull::None),
    ];

    // The reset-lock pin boots tri-state; it becomes an output only for the
    // lock edge in the cyclic pass.
    let mut reset_lock = Flex::new(p.PB1);
    reset_lock.set_as_input(Pull::None);

    let mut port = BoardPort {
        outputs,
        relay,
        reset_lock,
        led,
        inputs,
    };

    let mut uart_cfg = UartConfig::default();
    uart_cfg.baudrate = UART_BAUD;
    uart_cfg.data_bits = UartDataBits::DataBits8;
    uart_cfg.parity = UartParity::ParityNone;
    uart_cfg.stop_bits = UartStopBits::STOP1;

    let uart = Uart::new(
        p.USART3, p.PC11, p.PC10, Irqs, p.DMA1_CH1, p.DMA1_CH2, uart_cfg,
    )
    .unwrap();
    let (uart_tx, uart_rx) = uart.split();

    // Ring-buffered RX so bytes arriving while a response is being rendered
    // are not lost.
    let uart_rx = uart_rx.into_ring_buffered(UART_RX_DMA_BUF.init([0; 256]));
    if let Err(e) = spawner.spawn(protocol_task(uart_rx, uart_tx)) {
        warn!("failed to spawn protocol_task: {:?}", e);
    }

    // 1 kHz cyclic pass with absolute deadlines; `Timer::at` keeps the
    // cadence free of per-iteration drift.
    let mut cyclic = CyclicIo::new();
    let mut last_state = WatchdogState::Init;
    let tick = Duration::from_millis(TICK_MS as u64);
    let mut next_tick = Instant::now() + tick;

    loop {
        let outcome =
            GUARD.lock(|guard| cyclic.tick(&mut port, &mut guard.borrow_mut(), &IO, &DIAG));

        if outcome.state != last_state {
            info!("watchdog state: {} -> {}", last_state, outcome.state);
            last_state = outcome.state;
        }

        if outcome.retrigger_required {
            // The burst stalls regular ticks for up to 10 s, the same
            // budget the timer-flag polling loop had on the original board.
            info!("self test off-phase done, running retrigger burst");
            let mut ticks = MsTicks::new();
            let burst = stop_and_retrigger(&mut port, &mut ticks);
            match burst.fault_code() {
                None => info!("retrigger burst passed"),
                Some(code) => {
                    warn!("retrigger burst failed: {}", burst);
                    GUARD.lock(|guard| guard.borrow_mut().fault(code, &DIAG));
                }
            }
            next_tick = Instant::now() + tick;
        }

        Timer::at(next_tick).await;
        next_tick += tick;
        let now = Instant::now();
        if next_tick <= now {
            // late (burst or long critical section): resync instead of
            // running hot to catch up
            next_tick = now + tick;
        }
    }
}
