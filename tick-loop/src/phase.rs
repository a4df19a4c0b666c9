use core::{fmt, time::Duration};
use std::time::Instant;

use tick_core::CancelToken;

/// One of the host's periodic update passes.
///
/// Both phases have identical mechanics and independent tick counters. A host
/// drives them in the order of [`TickPhase::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TickPhase {
    /// The per-frame logic pass.
    #[default]
    Update,
    /// The fixed-step physics pass.
    FixedUpdate,
}

impl TickPhase {
    pub const ALL: [TickPhase; 2] = [TickPhase::Update, TickPhase::FixedUpdate];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::Update => 0,
            Self::FixedUpdate => 1,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::FixedUpdate => "fixed_update",
        }
    }
}

impl fmt::Display for TickPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a poll item sees of the tick it is being advanced in.
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    pub phase: TickPhase,
    /// Number of the current tick of `phase`, starting at 1.
    pub tick: u64,
    /// Delta since the previous tick, scaled by the runtime's time scale.
    pub delta: Duration,
    pub unscaled_delta: Duration,
    pub now: Instant,
}

/// Where a tick-driven operation runs and what cancels it.
#[derive(Clone, Default)]
pub struct TickOptions {
    pub phase: TickPhase,
    pub token: CancelToken,
}

impl TickOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(mut self, phase: TickPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn token(mut self, token: CancelToken) -> Self {
        self.token = token;
        self
    }
}
