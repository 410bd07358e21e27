//! Relay self-test state machine.
//!
//! The watchdog relay is only allowed to pulse while the self test vouches
//! for it: every tick in which driving is permitted re-asserts a
//! confirmation flag that the watchdog consumes in the same tick. A tick
//! without self-test work therefore drops the relay by construction.
//!
//! The machine proves the readback loop in both directions: at power-on the
//! relay must read de-energised, and every 100 h the host has to request a
//! repeated test during which the relay is deliberately dropped and
//! re-energised while the readback is watched.

use crate::diag::{DiagStore, EXECUTED_TEST_SELF_TEST, FaultCode};

/// Consecutive matching readback samples required to accept a level.
pub const CONSECUTIVE_SAMPLES: u8 = 5;
/// Window within which the expected readback level has to settle.
pub const POLL_WINDOW_TICKS: u16 = 10_000;
/// Budget until the next repeated test has to run: 100 h of 1 ms ticks.
pub const REPEAT_BUDGET_TICKS: u32 = 100 * 60 * 60 * 1000;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestState {
    /// Power-on check: readback must report the de-energised relay.
    Initial,
    /// Repeated test, first half: relay still driven, readback must be HIGH.
    RepeatedExpectOn,
    /// Repeated test, second half: relay dropped, readback must be LOW.
    RepeatedExpectOff,
    Passed,
    /// Terminal; the watchdog is forced into its error state.
    Failed,
}

pub struct SelfTest {
    state: TestState,
    /// Countdown of consecutive matching samples, re-armed on every mismatch.
    matching: u8,
    window: u16,
    /// Ticks left in `Passed` before a repeated test becomes overdue.
    budget: u32,
    requested: bool,
    confirmed: bool,
}

impl SelfTest {
    pub const fn new() -> Self {
        Self {
            state: TestState::Initial,
            matching: CONSECUTIVE_SAMPLES,
            window: POLL_WINDOW_TICKS,
            budget: 0,
            requested: false,
            confirmed: false,
        }
    }

    pub fn state(&self) -> TestState {
        self.state
    }

    /// Files a repeated-test request. Accepted only while the machine sits
    /// in `Passed`; anything else reports rejection and changes nothing.
    pub fn request(&mut self) -> bool {
        if self.state == TestState::Passed {
            self.requested = true;
            true
        } else {
            false
        }
    }

    /// Consumes the per-tick driving permission.
    pub fn take_confirmation(&mut self) -> bool {
        core::mem::replace(&mut self.confirmed, false)
    }

    /// Drops into `Failed` from outside, used when the retrigger burst after
    /// a repeated test cannot recover the relay.
    pub fn force_failed(&mut self) {
        self.state = TestState::Failed;
        self.confirmed = false;
    }

    fn enter(&mut self, next: TestState) {
        self.state = next;
        self.matching = CONSECUTIVE_SAMPLES;
        self.window = POLL_WINDOW_TICKS;
    }

    // One expectation step: `true` once the level has been stable for the
    // required number of consecutive samples.
    fn sample(&mut self, readback: bool, expected: bool) -> bool {
        if readback == expected {
            self.matching -= 1;
            if self.matching == 0 {
                return true;
            }
        } else {
            self.matching = CONSECUTIVE_SAMPLES;
        }
        false
    }

    // `true` when the poll window for the current expectation has expired.
    fn window_expired(&mut self) -> bool {
        self.window -= 1;
        self.window == 0
    }

    fn pass(&mut self, diag: &DiagStore) {
        diag.record_executed_test(EXECUTED_TEST_SELF_TEST);
        self.budget = REPEAT_BUDGET_TICKS;
        self.enter(TestState::Passed);
        self.confirmed = true;
    }

    fn fail(&mut self, code: FaultCode, diag: &DiagStore) {
        diag.record_error(code);
        self.enter(TestState::Failed);
        self.confirmed = false;
    }

    /// Advances the machine by one tick. Returns `true` on the tick that
    /// completes the off-phase of a repeated test, i.e. when the relay has
    /// just proven it can drop and now needs the retrigger burst to come
    /// back faster than the regular pulse cadence allows.
    pub fn tick(&mut self, readback: bool, diag: &DiagStore) -> bool {
        match self.state {
            TestState::Initial => {
                if self.sample(readback, false) {
                    self.pass(diag);
                } else if self.window_expired() {
                    self.fail(FaultCode::InitialSelfTestError, diag);
                }
            }
            TestState::Passed => {
                if self.requested {
                    self.requested = false;
                    self.enter(TestState::RepeatedExpectOn);
                    self.confirmed = true;
                } else if self.budget <= 1 {
                    self.fail(FaultCode::RepeatedSelfTestRequestMissed, diag);
                } else {
                    self.budget -= 1;
                    self.confirmed = true;
                }
            }
            TestState::RepeatedExpectOn => {
                if self.sample(readback, true) {
                    // relay verified ON; from the next tick on nothing
                    // confirms, so it drops for the off-check
                    self.enter(TestState::RepeatedExpectOff);
                    self.confirmed = true;
                } else if self.window_expired() {
                    self.fail(FaultCode::RepeatedSelfTestOnError, diag);
                } else {
                    self.confirmed = true;
                }
            }
            TestState::RepeatedExpectOff => {
                if self.sample(readback, false) {
                    self.pass(diag);
                    return true;
                } else if self.window_expired() {
                    self.fail(FaultCode::RepeatedSelfTestOffError, diag);
                }
            }
            TestState::Failed => {}
        }
        false
    }
}

impl Default for SelfTest {
    fn default() -> Self {
        Self::new()
    }
}
