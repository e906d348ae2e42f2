#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected {
        client_index: usize,
    },
    ClientDisconnected {
        client_index: usize,
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The application asked for it.
    Requested,
    /// The transport dropped the client (timeout or peer disconnect).
    Transport,
    /// The peer broke the protocol.
    ConnectionError,
    ServerStopped,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Requested => "disconnected",
            DisconnectReason::Transport => "dropped by transport",
            DisconnectReason::ConnectionError => "connection error",
            DisconnectReason::ServerStopped => "server stopped",
        }
    }
}
