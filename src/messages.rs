use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
}

impl Presence {
    pub fn from_responding(responding: bool) -> Self {
        if responding {
            Presence::Present
        } else {
            Presence::Absent
        }
    }

    pub fn is_present(self) -> bool {
        self == Presence::Present
    }
}

/// The debounced presence model, published by the monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresenceState {
    pub presence: Presence,
    /// When `presence` last changed, or process start.
    pub since: Instant,
}

impl PresenceState {
    pub fn absent() -> Self {
        PresenceState {
            presence: Presence::Absent,
            since: Instant::now(),
        }
    }
}

/// Emitted once per real transition of the aggregate presence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresenceEvent {
    pub presence: Presence,
    pub at: Instant,
    pub generation: u64,
}

/// A debounced press of the manual trigger, tagged with the configuration
/// generation whose bindings observed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerPress {
    pub generation: u64,
}
