use super::TunnelTarget;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::debug;

/// Lifecycle of one CONNECT tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    New,
    HostResolved,
    ClientHandshaking,
    UpstreamDialed,
    Bridging,
    Closed,
    Aborted,
}

impl TunnelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Aborted)
    }

    fn can_advance_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Aborted) => true,
            (New, HostResolved)
            | (HostResolved, ClientHandshaking)
            | (HostResolved, UpstreamDialed)
            | (ClientHandshaking, UpstreamDialed)
            | (UpstreamDialed, ClientHandshaking)
            | (UpstreamDialed, Bridging)
            | (ClientHandshaking, Bridging)
            | (Bridging, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::New => "new",
            TunnelState::HostResolved => "host_resolved",
            TunnelState::ClientHandshaking => "client_handshaking",
            TunnelState::UpstreamDialed => "upstream_dialed",
            TunnelState::Bridging => "bridging",
            TunnelState::Closed => "closed",
            TunnelState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for a single tunnel as it moves through [`TunnelState`].
pub struct TunnelSession {
    pub peer: SocketAddr,
    target: Option<TunnelTarget>,
    state: TunnelState,
    opened: Instant,
}

impl TunnelSession {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            target: None,
            state: TunnelState::New,
            opened: Instant::now(),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn target(&self) -> Option<&TunnelTarget> {
        self.target.as_ref()
    }

    pub fn resolved(&mut self, target: TunnelTarget) {
        self.target = Some(target);
        self.advance(TunnelState::HostResolved);
    }

    /// Moves to `next` if the transition is legal. Illegal transitions are
    /// ignored and reported as `false`.
    pub fn advance(&mut self, next: TunnelState) -> bool {
        if !self.state.can_advance_to(next) {
            debug!(peer = %self.peer, from = %self.state, to = %next, "Ignoring tunnel transition");
            return false;
        }
        debug!(
            peer = %self.peer,
            target = self.target.as_ref().map(|t| t.authority()).unwrap_or_default(),
            from = %self.state,
            to = %next,
            elapsed_ms = self.opened.elapsed().as_millis() as u64,
            "Tunnel state changed"
        );
        self.state = next;
        true
    }

    pub fn abort(&mut self) {
        self.advance(TunnelState::Aborted);
    }
}
