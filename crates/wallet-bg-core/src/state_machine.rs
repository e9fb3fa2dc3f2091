use crate::domain::ConnectionStatus;
use crate::ports::PortError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Idle | Self::Disconnected => ConnectionStatus::Disconnected,
            Self::Connecting => ConnectionStatus::Connecting,
            Self::Connected => ConnectionStatus::Connected,
            Self::Error => ConnectionStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    Connect,
    HandshakeOk,
    HandshakeFailed,
    TransportLost,
    TransportRestored,
    GiveUp,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: &'static str,
}

pub fn connection_transition(
    from: ConnectionState,
    action: ConnectionAction,
) -> Result<(ConnectionState, StateTransition), PortError> {
    use ConnectionAction as A;
    use ConnectionState as S;

    let (to, reason) = match (from, action) {
        (S::Idle | S::Disconnected | S::Error, A::Connect) => (S::Connecting, "connect"),
        (S::Connecting, A::HandshakeOk) => (S::Connected, "handshake_ok"),
        (S::Connecting, A::HandshakeFailed) => (S::Error, "handshake_failed"),
        (S::Connected | S::Disconnected, A::TransportLost) => (S::Disconnected, "transport_lost"),
        (S::Connected | S::Disconnected, A::TransportRestored) => {
            (S::Connected, "transport_restored")
        }
        (S::Connected | S::Disconnected, A::GiveUp) => (S::Error, "give_up"),
        (_, A::Stop) => (S::Disconnected, "stop"),
        _ => {
            return Err(PortError::Validation(format!(
                "illegal connection transition: {from:?} + {action:?}"
            )))
        }
    };
    Ok((to, StateTransition { from, to, reason }))
}
