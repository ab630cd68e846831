//! Module lifecycle states and the pure transition rules between them.
//!
//! Every state write in the hub goes through one of the functions here (via the
//! [`ModuleRecord`](crate::core::module::ModuleRecord) methods that wrap them), so
//! the rules can be tested without any I/O or locking.
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a module record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModuleState {
    /// Never confirmed alive, or liveness lost
    #[default]
    Unknown,
    Downloaded,
    Loading,
    Online,
    Stopped,
    Error,
}

impl ModuleState {
    /// Pending states that a failed liveness check must not downgrade.
    pub fn is_protected(self) -> bool {
        matches!(self, ModuleState::Loading | ModuleState::Downloaded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModuleState::Unknown => "UNKNOWN",
            ModuleState::Downloaded => "DOWNLOADED",
            ModuleState::Loading => "LOADING",
            ModuleState::Online => "ONLINE",
            ModuleState::Stopped => "STOPPED",
            ModuleState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs of a liveness-driven transition besides the probe result.
#[derive(Debug, Clone, Copy, Default)]
pub struct LivenessContext {
    /// Start was issued and no handshake has arrived since
    pub awaiting_handshake: bool,
    /// The record has been Loading for longer than the configured timeout
    pub loading_expired: bool,
}

/// Result of applying one liveness report to a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessTransition {
    pub next: ModuleState,
    /// Drop the module from the supervisor's tracked set
    pub untrack: bool,
}

/// Supervisor rule: map the current state and a liveness result to the next state.
pub fn on_liveness(
    current: ModuleState,
    alive: bool,
    ctx: LivenessContext,
) -> LivenessTransition {
    use ModuleState::*;

    let next = |next| LivenessTransition {
        next,
        untrack: false,
    };

    // launched but never registered: the process answering does not help
    if current == Loading && ctx.awaiting_handshake && ctx.loading_expired {
        return LivenessTransition {
            next: Error,
            untrack: true,
        };
    }

    if alive {
        return match current {
            Loading if ctx.awaiting_handshake => next(Loading),
            Loading | Unknown | Error | Online => next(Online),
            // a stopped module answers until its grace window ends
            Downloaded | Stopped => next(current),
        };
    }

    match current {
        Loading if ctx.loading_expired => LivenessTransition {
            next: Error,
            untrack: true,
        },
        Loading | Downloaded => next(current),
        Unknown | Online | Stopped | Error => LivenessTransition {
            next: Unknown,
            untrack: true,
        },
    }
}

/// Stop is only permitted on an Online module.
pub fn can_stop(current: ModuleState) -> bool {
    current == ModuleState::Online
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ModuleState; 6] = [
        ModuleState::Unknown,
        ModuleState::Downloaded,
        ModuleState::Loading,
        ModuleState::Online,
        ModuleState::Stopped,
        ModuleState::Error,
    ];

    #[test]
    fn test_protected_states_survive_failures() {
        for state in [ModuleState::Loading, ModuleState::Downloaded] {
            let t = on_liveness(state, false, LivenessContext::default());
            assert_eq!(t.next, state);
            assert!(!t.untrack);
        }
    }

    #[test]
    fn test_unprotected_states_lose_liveness() {
        for state in ALL.into_iter().filter(|s| !s.is_protected()) {
            let t = on_liveness(state, false, LivenessContext::default());
            assert_eq!(t.next, ModuleState::Unknown, "from {state}");
            assert!(t.untrack);
        }
    }

    #[test]
    fn test_loading_timeout_turns_into_error() {
        let ctx = LivenessContext {
            awaiting_handshake: true,
            loading_expired: true,
        };
        let t = on_liveness(ModuleState::Loading, false, ctx);
        assert_eq!(t.next, ModuleState::Error);
        assert!(t.untrack);
    }

    #[test]
    fn test_alive_without_handshake_still_times_out() {
        let ctx = LivenessContext {
            awaiting_handshake: true,
            loading_expired: true,
        };
        let t = on_liveness(ModuleState::Loading, true, ctx);
        assert_eq!(t.next, ModuleState::Error);
        assert!(t.untrack);

        // a registered module that is answering is promoted despite the timer
        let registered = LivenessContext {
            awaiting_handshake: false,
            loading_expired: true,
        };
        assert_eq!(
            on_liveness(ModuleState::Loading, true, registered).next,
            ModuleState::Online
        );
    }

    #[test]
    fn test_loading_promoted_only_after_handshake() {
        let waiting = LivenessContext {
            awaiting_handshake: true,
            loading_expired: false,
        };
        assert_eq!(
            on_liveness(ModuleState::Loading, true, waiting).next,
            ModuleState::Loading
        );
        assert_eq!(
            on_liveness(ModuleState::Loading, true, LivenessContext::default()).next,
            ModuleState::Online
        );
    }

    #[test]
    fn test_success_never_untracks() {
        for state in ALL {
            assert!(!on_liveness(state, true, LivenessContext::default()).untrack);
        }
        assert_eq!(
            on_liveness(ModuleState::Stopped, true, LivenessContext::default()).next,
            ModuleState::Stopped
        );
        assert_eq!(
            on_liveness(ModuleState::Unknown, true, LivenessContext::default()).next,
            ModuleState::Online
        );
    }

    #[test]
    fn test_can_stop_only_online() {
        for state in ALL {
            assert_eq!(can_stop(state), state == ModuleState::Online);
        }
    }

    #[test]
    fn test_state_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&ModuleState::Online).unwrap(),
            "\"ONLINE\""
        );
        assert_eq!(ModuleState::Stopped.to_string(), "STOPPED");
    }
}
