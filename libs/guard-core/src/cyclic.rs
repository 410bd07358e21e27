//! Cyclic I/O pass: pin driving, LED policy, reset-lock sequencing and the
//! retrigger burst.
//!
//! Runs once per millisecond. All pulsed pins share one polarity bit so
//! their edges line up; the watchdog relay only ever pulses on ticks the
//! watchdog explicitly permitted.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::diag::DiagStore;
use crate::watchdog::{Guard, WatchdogState};

/// Host-settable outputs; the watchdog relay is driven separately and can
/// never be addressed as one of these.
pub const SUPPORTED_OUTPUTS: usize = 7;
pub const SUPPORTED_INPUTS: usize = 4;
/// Input that senses the watchdog relay's actual state.
pub const READBACK_INPUT: usize = 0;

// Pulse policy: the first three outputs carry 1 ms square waves while ON,
// the rest hold their level.
const PULSED: [bool; SUPPORTED_OUTPUTS] = [true, true, true, false, false, false, false];

// LED blink half-periods in ticks.
const LED_OK_TICKS: u16 = 2000;
const LED_ERROR_TICKS: u16 = 100;

/// Everything the cyclic pass needs from the board: plain digital I/O plus
/// the two-step tri-state discipline of the reset-lock pin.
pub trait GuardPort {
    fn write_output(&mut self, index: usize, high: bool);
    fn write_relay(&mut self, high: bool);
    fn write_led(&mut self, high: bool);
    fn read_input(&mut self, index: usize) -> bool;
    /// Reset-lock pin: tri-state input -> push-pull driven HIGH.
    fn lock_reset(&mut self);
    /// Reset-lock pin: drive LOW first (pull-up off), then back to
    /// tri-state input.
    fn release_reset(&mut self);
}

/// Host-visible output slots and sampled input slots. Single-word cells,
/// shared between the protocol and cyclic contexts without locking.
pub struct IoStore {
    outputs: [AtomicBool; SUPPORTED_OUTPUTS],
    inputs: [AtomicBool; SUPPORTED_INPUTS],
}

impl IoStore {
    pub const fn new() -> Self {
        Self {
            outputs: [const { AtomicBool::new(false) }; SUPPORTED_OUTPUTS],
            inputs: [const { AtomicBool::new(false) }; SUPPORTED_INPUTS],
        }
    }

    /// Sets an output slot, returning its previous state. Out-of-range
    /// indices are rejected upstream by the protocol; they are ignored here.
    pub fn set_output(&self, index: usize, on: bool) -> bool {
        match self.outputs.get(index) {
            Some(slot) => slot.swap(on, Ordering::Relaxed),
            None => false,
        }
    }

    pub fn output(&self, index: usize) -> bool {
        self.outputs
            .get(index)
            .map(|slot| slot.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn store_input(&self, index: usize, high: bool) {
        if let Some(slot) = self.inputs.get(index) {
            slot.store(high, Ordering::Relaxed);
        }
    }

    pub fn input(&self, index: usize) -> bool {
        self.inputs
            .get(index)
            .map(|slot| slot.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

impl Default for IoStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-tick pin driving state machine.
pub struct CyclicIo {
    /// Shared polarity of every pulsed pin this tick.
    high_cycle: bool,
    reset_locked: bool,
    led_high: bool,
    led_ticks: u16,
}

impl CyclicIo {
    pub const fn new() -> Self {
        Self {
            high_cycle: false,
            reset_locked: false,
            // LED starts HIGH at boot
            led_high: true,
            led_ticks: 0,
        }
    }

    fn led_update(&mut self, state: WatchdogState) {
        let half_period = match state {
            WatchdogState::Init => {
                // steady HIGH until the watchdog leaves Init
                self.led_high = true;
                self.led_ticks = 0;
                return;
            }
            WatchdogState::Ok => LED_OK_TICKS,
            WatchdogState::Error => LED_ERROR_TICKS,
        };
        self.led_ticks += 1;
        if self.led_ticks >= half_period {
            self.led_ticks = 0;
            self.led_high = !self.led_high;
        }
    }

    /// One full I/O pass.
    ///
    /// The caller holds the watchdog critical section for the duration of
    /// the pass, which reproduces the ISR-owned cyclic task of the target.
    pub fn tick<P: GuardPort>(
        &mut self,
        port: &mut P,
        guard: &mut Guard,
        io: &IoStore,
        diag: &DiagStore,
    ) -> CyclicOutcome {
        self.high_cycle = !self.high_cycle;

        // self test wants the freshest readback, not last tick's sample
        let readback = port.read_input(READBACK_INPUT);
        let report = guard.tick(readback, diag);

        port.write_relay(report.drive_relay && self.high_cycle);

        // reset-lock pin moves only on edges; re-driving an already locked
        // pin would repeat the tri-state handover
        if report.lock_required != self.reset_locked {
            if report.lock_required {
                port.lock_reset();
            } else {
                port.release_reset();
            }
            self.reset_locked = report.lock_required;
        }

        // every logical output falls LOW the moment the watchdog is not Ok
        let outputs_live = report.state == WatchdogState::Ok;
        for index in 0..SUPPORTED_OUTPUTS {
            let on = outputs_live && io.output(index);
            let level = on && (self.high_cycle || !PULSED[index]);
            port.write_output(index, level);
        }

        for index in 0..SUPPORTED_INPUTS {
            io.store_input(index, port.read_input(index));
        }

        self.led_update(report.state);
        port.write_led(self.led_high);

        CyclicOutcome {
            state: report.state,
            retrigger_required: report.retrigger_required,
        }
    }
}

/// What the cyclic driver needs to know after a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CyclicOutcome {
    pub state: WatchdogState,
    /// The off-phase of a repeated self test just completed; run
    /// [`stop_and_retrigger`] before the next regular tick.
    pub retrigger_required: bool,
}

impl Default for CyclicIo {
    fn default() -> Self {
        Self::new()
    }
}

/// 1 ms time base for the retrigger burst. The firmware polls the timer;
/// tests script it.
pub trait TickSource {
    /// `true` exactly once per elapsed millisecond.
    fn tick_elapsed(&mut self) -> bool;
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetriggerOutcome {
    Passed,
    /// Readback never reported the dropped relay.
    StopFailed,
    /// Readback never reported the re-energised relay.
    RetriggerFailed,
}

impl RetriggerOutcome {
    /// Fault to latch when the burst fails; the failing phase maps onto the
    /// matching repeated-self-test error.
    pub fn fault_code(self) -> Option<crate::diag::FaultCode> {
        match self {
            RetriggerOutcome::Passed => None,
            RetriggerOutcome::StopFailed => Some(crate::diag::FaultCode::RepeatedSelfTestOffError),
            RetriggerOutcome::RetriggerFailed => {
                Some(crate::diag::FaultCode::RepeatedSelfTestOnError)
            }
        }
    }
}

// Shared budget for both burst phases, in 1 ms tick events.
const RETRIGGER_BUDGET_TICKS: u16 = 10_000;
// Debounced LOW observations that prove the relay has dropped.
const RETRIGGER_LOW_SAMPLES: u8 = 5;
// HIGH observations that prove the relay is holding again.
const RETRIGGER_HIGH_SAMPLES: u16 = 500;
// Relay edges emitted between consecutive readback checks.
const RETRIGGER_EDGES_PER_CHECK: u8 = 4;

/// Tight relay recovery after the deliberate pulse-off of a repeated self
/// test. The regular 1 ms cadence is too slow to pull the relay back in, so
/// phase B hammers edges at loop speed while the budget is walked down by
/// observed timer ticks.
///
/// Runs to completion in the cyclic context; regular ticks (and the
/// protocol) are stalled for up to 10 s, exactly like the target's
/// timer-flag polling loop.
pub fn stop_and_retrigger<P: GuardPort, T: TickSource>(
    port: &mut P,
    ticks: &mut T,
) -> RetriggerOutcome {
    let mut budget = RETRIGGER_BUDGET_TICKS;

    // Phase A: debounce the drop, one sample per tick.
    let mut low_seen: u8 = 0;
    while low_seen < RETRIGGER_LOW_SAMPLES {
        if !ticks.tick_elapsed() {
            continue;
        }
        if !port.read_input(READBACK_INPUT) {
            low_seen += 1;
        }
        budget -= 1;
        if budget == 0 {
            return RetriggerOutcome::StopFailed;
        }
    }

    // Phase B: edge bursts until the readback holds HIGH often enough.
    let mut high_seen: u16 = 0;
    loop {
        for _ in 0..RETRIGGER_EDGES_PER_CHECK {
            port.write_relay(true);
            port.write_relay(false);
        }
        if port.read_input(READBACK_INPUT) {
            high_seen += 1;
            if high_seen >= RETRIGGER_HIGH_SAMPLES {
                return RetriggerOutcome::Passed;
            }
        }
        if ticks.tick_elapsed() {
            budget -= 1;
            if budget == 0 {
                return RetriggerOutcome::RetriggerFailed;
            }
        }
    }
}
