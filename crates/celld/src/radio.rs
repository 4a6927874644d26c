//! Simulated radio layer.
//!
//! One thread per slot takes dial/hang-up commands and reports back over a
//! shared channel after a short random delay, the way a modem would answer
//! asynchronously. Established calls occasionally drop on their own.

use std::collections::HashSet;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use celld_core::Purpose;
use celld_core::context::{AttemptResult, ConnectionHandle};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rand::RngExt as _;
use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Debug, Clone)]
pub enum RadioCommand {
    Dial { purpose: Purpose, candidate: String },
    Hangup { purpose: Purpose },
    /// Forget every call without reporting, after a backend swap.
    Reset,
}

#[derive(Debug, Clone)]
pub enum RadioReport {
    Attempt {
        slot: usize,
        purpose: Purpose,
        candidate: String,
        result: AttemptResult,
    },
    Disconnected {
        slot: usize,
        purpose: Purpose,
        reason: &'static str,
    },
}

/// Outcome odds for a dial attempt.
#[derive(Debug, Clone, Copy)]
pub struct RadioProfile {
    pub success: f64,
    pub transient: f64,
    /// Per-tick chance that an established call drops.
    pub drop_per_tick: f64,
    pub tick: Duration,
}

impl Default for RadioProfile {
    fn default() -> Self {
        Self {
            success: 0.6,
            transient: 0.3,
            drop_per_tick: 0.002,
            tick: Duration::from_millis(100),
        }
    }
}

pub fn spawn(
    slot: usize,
    seed: u64,
    profile: RadioProfile,
    commands: Receiver<RadioCommand>,
    reports: Sender<RadioReport>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("radio-{slot}"))
        .spawn(move || {
            let mut radio = SimRadio {
                slot,
                rng: StdRng::seed_from_u64(seed.wrapping_add(slot as u64)),
                profile,
                connected: HashSet::new(),
                next_handle: 1,
                reports,
            };
            radio.run(commands);
        })
}

struct SimRadio {
    slot: usize,
    rng: StdRng,
    profile: RadioProfile,
    connected: HashSet<Purpose>,
    next_handle: u64,
    reports: Sender<RadioReport>,
}

impl SimRadio {
    fn run(&mut self, commands: Receiver<RadioCommand>) {
        tracing::debug!(slot = self.slot, "simulated radio up");
        loop {
            match commands.recv_timeout(self.profile.tick) {
                Ok(cmd) => {
                    if !self.handle(cmd) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.maybe_drop() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!(slot = self.slot, "simulated radio down");
    }

    /// Returns false once the report channel is gone.
    fn handle(&mut self, cmd: RadioCommand) -> bool {
        match cmd {
            RadioCommand::Dial { purpose, candidate } => {
                thread::sleep(Duration::from_millis(self.rng.random_range(20..200)));
                let roll: f64 = self.rng.random();
                let result = if roll < self.profile.success {
                    self.connected.insert(purpose);
                    let handle = ConnectionHandle(self.next_handle);
                    self.next_handle += 1;
                    AttemptResult::Success(handle)
                } else if roll < self.profile.success + self.profile.transient {
                    AttemptResult::TransientFailure
                } else {
                    AttemptResult::PermanentFailure
                };
                tracing::debug!(slot = self.slot, %purpose, %candidate, ?result, "dial finished");
                self.send(RadioReport::Attempt {
                    slot: self.slot,
                    purpose,
                    candidate,
                    result,
                })
            }
            RadioCommand::Hangup { purpose } => {
                self.connected.remove(&purpose);
                thread::sleep(Duration::from_millis(self.rng.random_range(5..50)));
                self.send(RadioReport::Disconnected {
                    slot: self.slot,
                    purpose,
                    reason: "localHangup",
                })
            }
            RadioCommand::Reset => {
                self.connected.clear();
                true
            }
        }
    }

    fn maybe_drop(&mut self) -> bool {
        let p = self.profile.drop_per_tick;
        let rng = &mut self.rng;
        let dropped: Vec<Purpose> = self
            .connected
            .iter()
            .copied()
            .filter(|_| rng.random_bool(p))
            .collect();
        for purpose in dropped {
            self.connected.remove(&purpose);
            tracing::debug!(slot = self.slot, %purpose, "call dropped by network");
            if !self.send(RadioReport::Disconnected {
                slot: self.slot,
                purpose,
                reason: "lostConnection",
            }) {
                return false;
            }
        }
        true
    }

    fn send(&self, report: RadioReport) -> bool {
        self.reports.send(report).is_ok()
    }
}
