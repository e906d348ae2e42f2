use std::net::SocketAddr;

use log::{debug, info};

use super::base::{BaseServer, ServerError};
use super::events::DisconnectReason;
use super::ServerInterface;
use crate::arena::Arena;
use crate::config::{KEY_BYTES, ServerConfig};
use crate::message::Message;
use crate::net::{SecureTransport, TransportFactory};

/// A dedicated server listening on one address through a
/// [`SecureTransport`].
///
/// The transport is created from `factory` on every start and dropped on
/// stop, so a stopped server holds no network resources.
pub struct Server<M: Message> {
    base: BaseServer<M>,
    factory: Box<dyn TransportFactory>,
    transport: Option<Box<dyn SecureTransport>>,
    address: SocketAddr,
    private_key: [u8; KEY_BYTES],
}

impl<M: Message> Server<M> {
    pub fn new(
        allocator: Arena,
        private_key: [u8; KEY_BYTES],
        address: SocketAddr,
        config: ServerConfig,
        factory: Box<dyn TransportFactory>,
        time: f64,
    ) -> Self {
        Self {
            base: BaseServer::new(config, allocator, time),
            factory,
            transport: None,
            address,
            private_key,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl<M: Message> ServerInterface<M> for Server<M> {
    fn base(&self) -> &BaseServer<M> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseServer<M> {
        &mut self.base
    }

    fn start(&mut self, max_clients: usize) -> Result<(), ServerError> {
        self.base.start(max_clients)?;

        let mut transport = self.factory.create(
            self.address,
            &self.private_key,
            self.base.config(),
            self.base.time(),
        );
        transport.start(max_clients);
        self.transport = Some(transport);
        info!("listening on {}", self.address);
        Ok(())
    }

    fn stop(&mut self) {
        if !self.base.is_running() {
            return;
        }
        for client_index in 0..self.base.max_clients() {
            self.base
                .disconnect_slot(client_index, DisconnectReason::ServerStopped);
        }
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect_all_clients();
            transport.stop();
        }
        self.base.stop();
    }

    fn disconnect_client(&mut self, client_index: usize) {
        if !self.base.is_client_connected(client_index) {
            debug!("ignoring disconnect of idle slot {}", client_index);
            return;
        }
        if let Some(transport) = &mut self.transport {
            transport.disconnect_client(client_index);
        }
        self.base
            .disconnect_slot(client_index, DisconnectReason::Requested);
    }

    fn disconnect_all_clients(&mut self) {
        if !self.base.is_running() {
            return;
        }
        for client_index in 0..self.base.max_clients() {
            self.disconnect_client(client_index);
        }
    }

    fn send_packets(&mut self) {
        let Some(transport) = &mut self.transport else {
            return;
        };
        self.base.send_packets(&mut |client_index, bytes| {
            if transport.is_client_connected(client_index) {
                transport.send_packet(client_index, bytes);
            }
        });
    }

    fn receive_packets(&mut self) {
        let Some(transport) = &mut self.transport else {
            return;
        };
        for client_index in 0..self.base.max_clients() {
            if !self.base.is_client_connected(client_index) {
                continue;
            }
            while let Some(packet) = transport.receive_packet(client_index) {
                if !self.base.process_packet(client_index, &packet) {
                    debug!(
                        "client {}: dropped packet of {} bytes",
                        client_index,
                        packet.len()
                    );
                }
            }
        }
    }

    fn advance_time(&mut self, time: f64) {
        let Self {
            base, transport, ..
        } = self;

        if let Some(transport) = transport.as_mut() {
            transport.update(time, &mut |client_index, connected| {
                if connected {
                    base.connect_slot(client_index);
                } else {
                    base.disconnect_slot(client_index, DisconnectReason::Transport);
                }
            });
        }

        for client_index in base.advance_time(time) {
            if let Some(transport) = transport.as_mut() {
                transport.disconnect_client(client_index);
            }
            base.disconnect_slot(client_index, DisconnectReason::ConnectionError);
        }
    }
}

impl<M: Message> Drop for Server<M> {
    fn drop(&mut self) {
        self.stop();
    }
}
