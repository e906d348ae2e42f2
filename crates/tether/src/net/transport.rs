use std::net::SocketAddr;

use crate::config::{KEY_BYTES, ServerConfig};

/// The encrypted datagram layer a server listens through.
///
/// It owns connection establishment: clients appear and disappear at its
/// discretion and are reported through the callback passed to
/// [`SecureTransport::update`]. Packets are opaque byte buffers addressed by
/// client index.
pub trait SecureTransport: Send {
    fn address(&self) -> SocketAddr;

    fn start(&mut self, max_clients: usize);

    fn stop(&mut self);

    /// Advances the transport clock. `on_connect_disconnect(client_index,
    /// connected)` fires for every client that connected or was dropped by
    /// the transport itself.
    fn update(&mut self, time: f64, on_connect_disconnect: &mut dyn FnMut(usize, bool));

    fn is_client_connected(&self, client_index: usize) -> bool;

    fn send_packet(&mut self, client_index: usize, data: &[u8]);

    fn receive_packet(&mut self, client_index: usize) -> Option<Vec<u8>>;

    /// Drops the client. Not reported through the `update` callback.
    fn disconnect_client(&mut self, client_index: usize);

    fn disconnect_all_clients(&mut self);
}

/// Builds the transport a server listens through when it starts.
pub trait TransportFactory: Send {
    fn create(
        &mut self,
        address: SocketAddr,
        private_key: &[u8; KEY_BYTES],
        config: &ServerConfig,
        time: f64,
    ) -> Box<dyn SecureTransport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Denied,
    TimedOut,
}

impl ClientState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Denied | Self::TimedOut)
    }
}

/// The peer end of a [`SecureTransport`].
pub trait ClientTransport: Send {
    fn state(&self) -> ClientState;

    /// The slot the server assigned, once connected.
    fn client_index(&self) -> Option<usize>;

    fn update(&mut self, time: f64);

    fn send_packet(&mut self, data: &[u8]);

    fn receive_packet(&mut self) -> Option<Vec<u8>>;

    fn disconnect(&mut self);
}
