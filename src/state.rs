//! Connection state model shared by the signal client and the engine.

use crate::protocol::DisconnectReason;

/// How a reconnect is being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectMode {
    /// Socket-only resume: the signal connection is re-dialed and ICE is
    /// restarted in place, skipping the join handshake.
    Quick,
    /// Full restart: a fresh session with a complete join handshake.
    Full,
}

/// How a connection attempt was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// First connection of a session.
    Normal,
    /// Recovery from a dropped session.
    Reconnect(ReconnectMode),
}

/// Connection lifecycle phase, carried by both the signal client and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected { reason: DisconnectReason },
    Connecting { mode: ConnectMode },
    Connected { mode: ConnectMode },
}

impl ConnectionState {
    /// Initial state before any connect attempt.
    pub fn new() -> Self {
        Self::Disconnected {
            reason: DisconnectReason::User,
        }
    }

    /// Coarse check: connected, in any mode.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Coarse check: disconnected, for any reason.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }

    /// True while a reconnect (quick or full) is being attempted.
    pub fn is_reconnecting(&self) -> bool {
        matches!(
            self,
            Self::Connecting {
                mode: ConnectMode::Reconnect(_)
            }
        )
    }

    /// Coarse equality: same phase, ignoring mode and reason.
    pub fn same_phase(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::Disconnected { .. }, Self::Disconnected { .. })
                | (Self::Connecting { .. }, Self::Connecting { .. })
                | (Self::Connected { .. }, Self::Connected { .. })
        )
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_comparison_ignores_associated_data() {
        let quick = ConnectionState::Connecting {
            mode: ConnectMode::Reconnect(ReconnectMode::Quick),
        };
        let normal = ConnectionState::Connecting {
            mode: ConnectMode::Normal,
        };
        assert!(quick.same_phase(&normal));
        assert_ne!(quick, normal);
    }

    #[test]
    fn reconnecting_excludes_normal_connecting() {
        let normal = ConnectionState::Connecting {
            mode: ConnectMode::Normal,
        };
        assert!(!normal.is_reconnecting());

        let full = ConnectionState::Connecting {
            mode: ConnectMode::Reconnect(ReconnectMode::Full),
        };
        assert!(full.is_reconnecting());
        assert!(!full.is_connected());
    }

    #[test]
    fn default_is_user_disconnected() {
        let state = ConnectionState::default();
        assert!(state.is_disconnected());
        assert_eq!(
            state,
            ConnectionState::Disconnected {
                reason: DisconnectReason::User
            }
        );
    }
}
