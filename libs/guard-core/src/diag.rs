//! Fault latch and diagnosis accumulators.
//!
//! All three cells are single words written from the cyclic context and
//! consumed from the protocol context, so they are plain atomics: the `D`
//! command reads them with consume-and-clear semantics and no lock is ever
//! taken around them.

use core::sync::atomic::{AtomicU16, Ordering};

pub const ERROR_NONE: u16 = 0;

/// Fault numbers reported through the `D` command.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum FaultCode {
    /// Readback refused to settle LOW during the power-on self test.
    InitialSelfTestError = 0x0001,
    /// Readback refused to report the energised relay during a repeated test.
    RepeatedSelfTestOnError = 0x0002,
    /// Readback refused to report the dropped relay during a repeated test.
    RepeatedSelfTestOffError = 0x0003,
    /// The host never requested a repeated self test within the test budget.
    RepeatedSelfTestRequestMissed = 0x0004,
    /// Watchdog counter ran down to zero without a retrigger.
    WatchdogNotTriggered = 0x1000,
    /// Host cleared a running watchdog via `W;0`.
    WatchdogCleared = 0x1001,
    /// Watchdog counter was observed at zero while still in the running state.
    WatchdogStoppedUnexpectedly = 0x1002,
}

/// Diagnosis bits; only the startup indicator is assigned so far.
pub const DIAGNOSIS_STARTUP: u16 = 1 << 0;

/// Executed-test bits; the lowest bit is the relay self test.
pub const EXECUTED_TEST_SELF_TEST: u16 = 1 << 0;

/// First-error-wins latch plus two OR-accumulators, each cleared by read.
pub struct DiagStore {
    error: AtomicU16,
    diagnoses: AtomicU16,
    executed_tests: AtomicU16,
}

impl DiagStore {
    pub const fn new() -> Self {
        Self {
            error: AtomicU16::new(ERROR_NONE),
            // the startup bit is pre-set so the first `D` proves a reboot
            diagnoses: AtomicU16::new(DIAGNOSIS_STARTUP),
            executed_tests: AtomicU16::new(0),
        }
    }

    /// Latches `code` only while no earlier fault is stored; the first
    /// fault is the one worth keeping.
    pub fn record_error(&self, code: FaultCode) {
        let _ = self.error.compare_exchange(
            ERROR_NONE,
            code as u16,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub fn record_diagnosis(&self, mask: u16) {
        self.diagnoses.fetch_or(mask, Ordering::Relaxed);
    }

    pub fn record_executed_test(&self, mask: u16) {
        self.executed_tests.fetch_or(mask, Ordering::Relaxed);
    }

    /// Returns the stored fault number and re-arms the latch.
    pub fn take_error(&self) -> u16 {
        self.error.swap(ERROR_NONE, Ordering::Relaxed)
    }

    pub fn take_diagnoses(&self) -> u16 {
        self.diagnoses.swap(0, Ordering::Relaxed)
    }

    pub fn take_executed_tests(&self) -> u16 {
        self.executed_tests.swap(0, Ordering::Relaxed)
    }
}

impl Default for DiagStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins_until_read() {
        let diag = DiagStore::new();
        assert_eq!(diag.take_error(), ERROR_NONE);

        diag.record_error(FaultCode::WatchdogCleared);
        diag.record_error(FaultCode::WatchdogNotTriggered);
        assert_eq!(diag.take_error(), FaultCode::WatchdogCleared as u16);

        // read cleared the latch, the next fault is stored again
        assert_eq!(diag.take_error(), ERROR_NONE);
        diag.record_error(FaultCode::WatchdogNotTriggered);
        assert_eq!(diag.take_error(), FaultCode::WatchdogNotTriggered as u16);
    }

    #[test]
    fn diagnoses_start_with_startup_bit_and_accumulate() {
        let diag = DiagStore::new();
        diag.record_diagnosis(1 << 3);
        assert_eq!(diag.take_diagnoses(), DIAGNOSIS_STARTUP | 1 << 3);
        assert_eq!(diag.take_diagnoses(), 0);
    }

    #[test]
    fn executed_tests_accumulate_and_clear() {
        let diag = DiagStore::new();
        assert_eq!(diag.take_executed_tests(), 0);
        diag.record_executed_test(EXECUTED_TEST_SELF_TEST);
        diag.record_executed_test(EXECUTED_TEST_SELF_TEST);
        assert_eq!(diag.take_executed_tests(), EXECUTED_TEST_SELF_TEST);
        assert_eq!(diag.take_executed_tests(), 0);
    }
}
