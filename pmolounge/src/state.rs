//! Session lifecycle as a pure transition function

use std::fmt;

/// Where a lounge session stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// Created, not started
    Unbound,
    /// Waiting for a lounge token
    TokenPending,
    /// Registering the pairing code
    Registering,
    /// Channels running, waiting for SID and gsessionid
    Connecting,
    /// Session established, commands flow
    Bound,
    /// The server forgot the SID; a new one is being negotiated
    Reconnecting,
    /// Terminal
    Stopped,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unbound => "unbound",
            Self::TokenPending => "token-pending",
            Self::Registering => "registering",
            Self::Connecting => "connecting",
            Self::Bound => "bound",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    TokenAcquired,
    TokenRefreshed,
    Registered,
    SessionEstablished,
    UnknownSid,
    ReconnectReady,
    Gone,
    Fatal,
    Quit,
}

/// Side effect the owner must carry out after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    FetchToken,
    Register,
    StartChannels,
    ResumeChannels,
    ClearSid,
    RefreshToken,
    StopChannels,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub to: SessionPhase,
    pub effect: Effect,
}

impl Transition {
    fn new(to: SessionPhase, effect: Effect) -> Self {
        Self { to, effect }
    }
}

/// Next phase and effect for `event` in `phase`; `None` when the event does not apply
pub fn step(phase: SessionPhase, event: SessionEvent) -> Option<Transition> {
    use Effect as E;
    use SessionEvent as Ev;
    use SessionPhase as P;

    let transition = match (phase, event) {
        (P::Stopped, _) => return None,
        (_, Ev::Fatal | Ev::Quit) => Transition::new(P::Stopped, E::StopChannels),
        (P::Unbound, Ev::Start) => Transition::new(P::TokenPending, E::FetchToken),
        (P::TokenPending, Ev::TokenAcquired) => Transition::new(P::Registering, E::Register),
        (P::TokenPending, Ev::TokenRefreshed) => Transition::new(P::Connecting, E::ResumeChannels),
        (P::Registering, Ev::Registered) => Transition::new(P::Connecting, E::StartChannels),
        (P::Connecting, Ev::SessionEstablished) => Transition::new(P::Bound, E::None),
        (P::Bound | P::Connecting, Ev::UnknownSid) => Transition::new(P::Reconnecting, E::ClearSid),
        (P::Reconnecting, Ev::ReconnectReady) => Transition::new(P::Connecting, E::None),
        (P::Bound | P::Connecting | P::Reconnecting, Ev::Gone) => {
            Transition::new(P::TokenPending, E::RefreshToken)
        }
        _ => return None,
    };
    Some(transition)
}
