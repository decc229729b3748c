//! Run/pause state word and the edge-triggered "state changed" signal.
//!
//! The level flags and a transition generation share one `AtomicU64`:
//!
//! ```text
//!   63                                   8 7        0
//!  ┌──────────────────────────────────────┬──────────┐
//!  │ generation                           │ flags    │
//!  └──────────────────────────────────────┴──────────┘
//! ```
//!
//! Every transition bumps the generation in the same store as the flags,
//! so a reader never sees new flags with an old generation or the other
//! way round. Pollers consume edges through a shared high-water mark:
//! each generation step is reported to exactly one caller, and several
//! transitions between two polls collapse into one report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::trace;
use vmprobe_protocol::StateFlags;

use crate::breakpoints::BreakpointId;
use crate::error::Result;
use crate::session::Session;
use crate::timer::Deadline;

const FLAG_BITS: u32 = 8;
const FLAG_MASK: u64 = (1 << FLAG_BITS) - 1;

fn pack(generation: u64, flags: StateFlags) -> u64 {
    (generation << FLAG_BITS) | u64::from(flags.bits())
}

fn flags_of(word: u64) -> StateFlags {
    StateFlags::from_bits_truncate((word & FLAG_MASK) as u8)
}

fn generation_of(word: u64) -> u64 {
    word >> FLAG_BITS
}

/// What stopped the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// A breakpoint of the session's table matched.
    Breakpoint { id: BreakpointId },
    /// A debug register the table does not own fired.
    DebugRegister { slot: u8 },
    /// The guest raised an exception it could not handle.
    Fault { vector: u8 },
}

/// Details of the current stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopInfo {
    /// vCPU the stop was raised on.
    pub vcpu: u32,
    /// Instruction pointer of the trapping instruction.
    pub rip: u64,
    /// Page-table root at the time of the stop.
    pub cr3: u64,
    pub cause: StopCause,
}

impl StopInfo {
    /// Matching breakpoint, if the stop came from the table.
    pub fn breakpoint(&self) -> Option<BreakpointId> {
        match self.cause {
            StopCause::Breakpoint { id } => Some(id),
            _ => None,
        }
    }
}

pub(crate) struct StateMonitor {
    word: AtomicU64,
    seen: AtomicU64,
    stop: Mutex<Option<StopInfo>>,
}

impl StateMonitor {
    pub(crate) fn new() -> Self {
        Self {
            word: AtomicU64::new(pack(0, StateFlags::RUNNING)),
            seen: AtomicU64::new(0),
            stop: Mutex::new(None),
        }
    }

    fn stop_slot(&self) -> MutexGuard<'_, Option<StopInfo>> {
        self.stop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the initial state without producing an edge.
    pub(crate) fn reset(&self, flags: StateFlags) {
        let generation = generation_of(self.word.load(Ordering::Acquire));
        self.seen.store(generation, Ordering::Release);
        self.word.store(pack(generation, flags), Ordering::Release);
        *self.stop_slot() = None;
    }

    /// Current flags, without side effects.
    pub(crate) fn peek(&self) -> StateFlags {
        flags_of(self.word.load(Ordering::Acquire))
    }

    /// Current flags as reported to a caller.
    ///
    /// The first read of a fresh breakpoint stop returns it with
    /// `DEBUGGER_ALERTED` clear and sets the bit in place, so later reads
    /// classify the same stop as already reported. This is not a
    /// transition and produces no edge.
    pub(crate) fn observe(&self) -> StateFlags {
        let fresh = StateFlags::PAUSED | StateFlags::BREAKPOINT_HIT;
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            let flags = flags_of(word);
            if !flags.contains(fresh) || flags.contains(StateFlags::DEBUGGER_ALERTED) {
                return flags;
            }
            let acknowledged = pack(
                generation_of(word),
                flags | StateFlags::DEBUGGER_ALERTED,
            );
            match self.word.compare_exchange_weak(
                word,
                acknowledged,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return flags,
                Err(current) => word = current,
            }
        }
    }

    /// `true` if a transition happened since any caller last saw one.
    pub(crate) fn changed(&self) -> bool {
        let generation = generation_of(self.word.load(Ordering::Acquire));
        self.seen.fetch_max(generation, Ordering::AcqRel) < generation
    }

    /// Apply `next` to the flags as one transition. `None` leaves the
    /// word untouched and produces no edge. Returns whether a transition
    /// happened.
    pub(crate) fn transition(&self, next: impl Fn(StateFlags) -> Option<StateFlags>) -> bool {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            let Some(flags) = next(flags_of(word)) else {
                return false;
            };
            let updated = pack(generation_of(word) + 1, flags);
            match self.word.compare_exchange_weak(
                word,
                updated,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!("state {} -> {}", flags_of(word), flags);
                    return true;
                }
                Err(current) => word = current,
            }
        }
    }

    /// Replace the flags without producing an edge.
    pub(crate) fn settle(&self, flags: StateFlags) {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            let updated = pack(generation_of(word), flags);
            match self.word.compare_exchange_weak(
                word,
                updated,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => word = current,
            }
        }
    }

    /// Publish a stop: details first, so an edge never outruns them.
    ///
    /// The details slot stays locked across the transition, which makes
    /// the pair atomic with respect to [`commit_resume`](Self::commit_resume).
    pub(crate) fn record_stop(&self, info: StopInfo, flags: StateFlags) {
        let mut stop = self.stop_slot();
        *stop = Some(info);
        self.transition(|_| Some(flags));
    }

    /// The raw word, to be handed back to
    /// [`commit_resume`](Self::commit_resume).
    pub(crate) fn mark(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    /// Record that the VM was resumed, if it was paused at `mark` and no
    /// transition happened since. A stop raised after the backend resumed
    /// wins over the commit. Clears the stop details on success.
    pub(crate) fn commit_resume(&self, mark: u64) -> bool {
        let mut stop = self.stop_slot();
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            if generation_of(word) != generation_of(mark) || !flags_of(word).is_paused() {
                return false;
            }
            let updated = pack(generation_of(word) + 1, StateFlags::RUNNING);
            match self.word.compare_exchange_weak(
                word,
                updated,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!("state {} -> {}", flags_of(word), StateFlags::RUNNING);
                    *stop = None;
                    return true;
                }
                Err(current) => word = current,
            }
        }
    }

    pub(crate) fn stop_info(&self) -> Option<StopInfo> {
        *self.stop_slot()
    }

    pub(crate) fn clear_stop(&self) {
        *self.stop_slot() = None;
    }
}

impl Session {
    /// Current state word. Never blocks.
    ///
    /// The first read of a fresh breakpoint stop reports it with
    /// `DEBUGGER_ALERTED` clear ([`StopOrigin::Mine`]); later reads of the
    /// same stop have the bit set.
    ///
    /// [`StopOrigin::Mine`]: vmprobe_protocol::StopOrigin::Mine
    pub fn get_state(&self) -> Result<StateFlags> {
        self.ready()?;
        Ok(self.exits.monitor.observe())
    }

    /// `true` if the VM changed state (pause, resume, breakpoint stop,
    /// restore) since any caller last got `true`. Changes between two
    /// polls are reported once.
    pub fn get_state_changed(&self) -> Result<bool> {
        self.ready()?;
        Ok(self.exits.monitor.changed())
    }

    /// Details of the current stop, if the VM is stopped by a trap.
    pub fn stop_info(&self) -> Result<Option<StopInfo>> {
        self.ready()?;
        Ok(self.exits.monitor.stop_info())
    }

    /// Poll for a state change until `deadline` is over. Returns the new
    /// state, or `None` if the deadline passed or was cancelled first.
    pub fn wait_for_state_change(&self, deadline: &Deadline) -> Result<Option<StateFlags>> {
        loop {
            if self.get_state_changed()? {
                return self.get_state().map(Some);
            }
            if !deadline.wait(self.config().poll_interval) {
                return Ok(None);
            }
        }
    }
}
