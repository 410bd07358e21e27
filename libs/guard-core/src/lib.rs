#![no_std]

//! Core logic of the relayguard firmware: the watchdog countdown with its
//! terminal error latch, the relay self-test machine that gates every single
//! relay pulse, the fault/diagnosis store shared between both execution
//! contexts, and the cyclic I/O pass that drives the pins once per
//! millisecond.
//!
//! Everything in here is hardware-free and runs under host unit tests; the
//! firmware crate supplies the GPIO port and the 1 ms time base.

#[cfg(test)]
extern crate std;

pub mod cyclic;
pub mod diag;
pub mod selftest;
pub mod watchdog;

pub use cyclic::{
    CyclicIo, CyclicOutcome, GuardPort, IoStore, RetriggerOutcome, TickSource, stop_and_retrigger,
};
pub use diag::{DiagStore, FaultCode};
pub use watchdog::{Guard, SetReport, TickReport, WatchdogState};
