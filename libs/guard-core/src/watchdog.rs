//! Watchdog countdown with terminal error latch and reset-lock timer.
//!
//! The `(state, counter, reset_lock)` triple is shared between the protocol
//! context (`set`, `request_self_test`) and the cyclic context (`tick`);
//! the owner of a `Guard` must serialise every call through a critical
//! section. The firmware keeps it behind a `CriticalSectionRawMutex`.

use crate::diag::{DiagStore, FaultCode};
use crate::selftest::{SelfTest, TestState};

/// Cyclic task period; the base unit of every countdown in this crate.
pub const TICK_MS: u32 = 1;
/// Retrigger budget: the host must prove liveness within ~60 s.
pub const TRIGGER_TICKS: u16 = (60_000 / TICK_MS) as u16;
/// Reset-lock grace period after a fault: ~30 s for the external
/// battery-cutoff circuitry to finish.
pub const LOCK_TICKS: u16 = (30_000 / TICK_MS) as u16;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogState {
    /// Power-on state; the watchdog may be armed at any time and a cleared
    /// counter is legal.
    Init,
    /// Armed. Reaching a cleared counter from here is a fault.
    Ok,
    /// Terminal until hardware reset.
    Error,
}

/// Outcome of a host `W` command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetReport {
    pub old_running: bool,
    pub new_running: bool,
    pub lock_required: bool,
}

/// Outcome of one cyclic tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickReport {
    /// The relay may pulse this tick: counter alive and the self test
    /// vouched for the loop this very tick.
    pub drive_relay: bool,
    pub lock_required: bool,
    /// The off-phase of a repeated self test just completed; the relay
    /// needs the tight retrigger burst to re-energise.
    pub retrigger_required: bool,
    pub state: WatchdogState,
}

pub struct Guard {
    state: WatchdogState,
    /// Ticks until the watchdog trips; 0 means cleared.
    counter: u16,
    /// Ticks the reset pin stays inhibited after a fault.
    reset_lock: u16,
    self_test: SelfTest,
}

impl Guard {
    pub const fn new() -> Self {
        Self {
            state: WatchdogState::Init,
            counter: 0,
            reset_lock: 0,
            self_test: SelfTest::new(),
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn running(&self) -> bool {
        self.counter != 0
    }

    pub fn lock_required(&self) -> bool {
        self.reset_lock != 0
    }

    pub fn test_state(&self) -> TestState {
        self.self_test.state()
    }

    // Single entry point into the terminal state: counter cleared, one
    // step off the reset-lock grace period.
    fn enter_error(&mut self) {
        self.state = WatchdogState::Error;
        self.counter = 0;
        if self.reset_lock > 0 {
            self.reset_lock -= 1;
        }
    }

    /// Host `W` command.
    ///
    /// `run = true` arms or re-arms outside of Error; `run = false` is a
    /// no-op in Init (usual during startup) and terminal in Ok.
    pub fn set(&mut self, run: bool, diag: &DiagStore) -> SetReport {
        let old_running = self.running();
        match (run, self.state) {
            (true, WatchdogState::Init) | (true, WatchdogState::Ok) => {
                self.counter = TRIGGER_TICKS;
                self.reset_lock = LOCK_TICKS;
                self.state = WatchdogState::Ok;
            }
            (false, WatchdogState::Ok) => {
                diag.record_error(FaultCode::WatchdogCleared);
                self.enter_error();
            }
            (false, WatchdogState::Init) => {
                self.counter = 0;
            }
            // already tripped: re-arming is not possible, clearing again
            // only walks the reset-lock grace period further down
            (true, WatchdogState::Error) => {}
            (false, WatchdogState::Error) => {
                if self.reset_lock > 0 {
                    self.reset_lock -= 1;
                }
            }
        }
        SetReport {
            old_running,
            new_running: self.running(),
            lock_required: self.lock_required(),
        }
    }

    /// Repeated-self-test request from the host (`T` command).
    pub fn request_self_test(&mut self) -> bool {
        self.self_test.request()
    }

    /// Forces the terminal state for a fault detected outside the machine
    /// itself (retrigger burst failure).
    pub fn fault(&mut self, code: FaultCode, diag: &DiagStore) {
        diag.record_error(code);
        self.self_test.force_failed();
        if self.state != WatchdogState::Error {
            self.enter_error();
        }
    }

    /// One cyclic tick: self test first, then the countdown.
    pub fn tick(&mut self, readback: bool, diag: &DiagStore) -> TickReport {
        let retrigger = self.self_test.tick(readback, diag);

        // a failed self test takes the watchdog down with it
        if self.self_test.state() == TestState::Failed && self.state != WatchdogState::Error {
            self.enter_error();
        }

        match self.state {
            WatchdogState::Init => {}
            WatchdogState::Ok => {
                if self.counter > 0 {
                    self.counter -= 1;
                    if self.counter == 0 {
                        diag.record_error(FaultCode::WatchdogNotTriggered);
                        self.enter_error();
                    }
                } else {
                    // armed but cleared without passing the countdown
                    diag.record_error(FaultCode::WatchdogStoppedUnexpectedly);
                    self.enter_error();
                }
            }
            WatchdogState::Error => {
                if self.reset_lock > 0 {
                    self.reset_lock -= 1;
                }
            }
        }

        let confirmed = self.self_test.take_confirmation();
        TickReport {
            drive_relay: self.counter > 0 && confirmed,
            lock_required: self.lock_required(),
            retrigger_required: retrigger && self.counter > 0,
            state: self.state,
        }
    }
}

impl Default for Guard {
    fn default() -> Self {
        Self::new()
    }
}
