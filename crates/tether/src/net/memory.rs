use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use super::transport::{ClientState, ClientTransport, SecureTransport, TransportFactory};
use crate::config::{ClientConfig, KEY_BYTES, ServerConfig};

#[derive(Debug)]
struct Listener {
    private_key: [u8; KEY_BYTES],
    protocol_id: u64,
    timeout: f64,
    time: f64,
    slots: Vec<Option<u64>>,
}

#[derive(Debug)]
struct Link {
    address: SocketAddr,
    private_key: [u8; KEY_BYTES],
    protocol_id: u64,
    client_id: u64,
    state: ClientState,
    client_index: Option<usize>,
    to_server: VecDeque<Vec<u8>>,
    to_client: VecDeque<Vec<u8>>,
    connect_time: f64,
    server_last_received: f64,
    client_last_received: Option<f64>,
    // The client end was dropped while the server still held the slot.
    orphaned: bool,
}

impl Link {
    fn close(&mut self, state: ClientState) {
        self.state = state;
        self.client_index = None;
        self.to_server.clear();
        self.to_client.clear();
    }
}

#[derive(Debug, Default)]
struct Hub {
    listeners: HashMap<SocketAddr, Listener>,
    links: HashMap<u64, Link>,
    next_link: u64,
}

impl Hub {
    /// Frees `slot` and forgets its link if the client end is gone.
    fn release_slot(&mut self, address: SocketAddr, index: usize, state: ClientState) {
        let Some(link_id) = self
            .listeners
            .get_mut(&address)
            .and_then(|listener| listener.slots.get_mut(index))
            .and_then(Option::take)
        else {
            return;
        };
        if let Some(link) = self.links.get_mut(&link_id) {
            link.close(state);
            if link.orphaned {
                self.links.remove(&link_id);
            }
        }
    }

    fn slot_link(&mut self, address: SocketAddr, index: usize) -> Option<(&mut Listener, &mut Link)> {
        let listener = self.listeners.get_mut(&address)?;
        let link_id = (*listener.slots.get(index)?)?;
        let link = self.links.get_mut(&link_id)?;
        Some((listener, link))
    }
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-process stand-in for a secure datagram network.
///
/// Servers listen on an address with a private key; clients connect by
/// address and key. Packets keep their boundaries and are delivered in order.
/// Nothing is encrypted.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(
        &self,
        address: SocketAddr,
        private_key: &[u8; KEY_BYTES],
        config: &ServerConfig,
        time: f64,
    ) -> MemoryServer {
        MemoryServer {
            hub: Arc::clone(&self.hub),
            address,
            private_key: *private_key,
            protocol_id: config.protocol_id,
            timeout: config.timeout_secs,
            time,
        }
    }

    /// Starts connecting to the server at `address`. The request is answered
    /// on that server's next update.
    pub fn connect(
        &self,
        address: SocketAddr,
        private_key: &[u8; KEY_BYTES],
        client_id: u64,
        config: &ClientConfig,
        time: f64,
    ) -> MemoryClient {
        let mut hub = lock(&self.hub);
        let link = hub.next_link;
        hub.next_link += 1;
        hub.links.insert(link, Link {
            address,
            private_key: *private_key,
            protocol_id: config.protocol_id,
            client_id,
            state: ClientState::Connecting,
            client_index: None,
            to_server: VecDeque::new(),
            to_client: VecDeque::new(),
            connect_time: time,
            server_last_received: time,
            client_last_received: None,
            orphaned: false,
        });
        debug!("client {} connecting to {}", client_id, address);

        MemoryClient {
            hub: Arc::clone(&self.hub),
            link,
            timeout: config.timeout_secs,
            time,
        }
    }
}

impl TransportFactory for MemoryNetwork {
    fn create(
        &mut self,
        address: SocketAddr,
        private_key: &[u8; KEY_BYTES],
        config: &ServerConfig,
        time: f64,
    ) -> Box<dyn SecureTransport> {
        Box::new(self.listen(address, private_key, config, time))
    }
}

/// The listening end of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryServer {
    hub: Arc<Mutex<Hub>>,
    address: SocketAddr,
    private_key: [u8; KEY_BYTES],
    protocol_id: u64,
    timeout: f64,
    time: f64,
}

impl SecureTransport for MemoryServer {
    fn address(&self) -> SocketAddr {
        self.address
    }

    fn start(&mut self, max_clients: usize) {
        let mut hub = lock(&self.hub);
        assert!(
            !hub.listeners.contains_key(&self.address),
            "address {} is already in use",
            self.address
        );
        hub.listeners.insert(self.address, Listener {
            private_key: self.private_key,
            protocol_id: self.protocol_id,
            timeout: self.timeout,
            time: self.time,
            slots: vec![None; max_clients],
        });
        info!("listening on {} for {} clients", self.address, max_clients);
    }

    fn stop(&mut self) {
        self.disconnect_all_clients();
        lock(&self.hub).listeners.remove(&self.address);
    }

    fn update(&mut self, time: f64, on_connect_disconnect: &mut dyn FnMut(usize, bool)) {
        self.time = time;
        let mut events = Vec::new();
        {
            let mut hub = lock(&self.hub);
            let Some(listener) = hub.listeners.get_mut(&self.address) else {
                return;
            };
            listener.time = time;
            let timeout = listener.timeout;
            let occupied: Vec<(usize, u64)> = listener
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| slot.map(|link| (index, link)))
                .collect();

            for (index, link_id) in occupied {
                let closed = match hub.links.get(&link_id) {
                    None => Some(ClientState::Disconnected),
                    Some(link) if link.state != ClientState::Connected => Some(link.state),
                    Some(link) if time - link.server_last_received > timeout => {
                        debug!("client {} in slot {} timed out", link.client_id, index);
                        Some(ClientState::TimedOut)
                    }
                    Some(_) => None,
                };
                if let Some(state) = closed {
                    hub.release_slot(self.address, index, state);
                    events.push((index, false));
                }
            }

            let mut pending: Vec<u64> = hub
                .links
                .iter()
                .filter(|(_, link)| {
                    link.state == ClientState::Connecting && link.address == self.address
                })
                .map(|(id, _)| *id)
                .collect();
            pending.sort_unstable();

            let Hub {
                listeners, links, ..
            } = &mut *hub;
            let Some(listener) = listeners.get_mut(&self.address) else {
                return;
            };
            for link_id in pending {
                let Some(link) = links.get_mut(&link_id) else {
                    continue;
                };
                if link.private_key != listener.private_key
                    || link.protocol_id != listener.protocol_id
                {
                    debug!("denying client {}: credentials do not match", link.client_id);
                    link.close(ClientState::Denied);
                    continue;
                }
                let Some(index) = listener.slots.iter().position(Option::is_none) else {
                    debug!("denying client {}: server is full", link.client_id);
                    link.close(ClientState::Denied);
                    continue;
                };
                listener.slots[index] = Some(link_id);
                link.state = ClientState::Connected;
                link.client_index = Some(index);
                link.server_last_received = time;
                events.push((index, true));
            }
        }

        for (client_index, connected) in events {
            on_connect_disconnect(client_index, connected);
        }
    }

    fn is_client_connected(&self, client_index: usize) -> bool {
        lock(&self.hub)
            .listeners
            .get(&self.address)
            .and_then(|listener| listener.slots.get(client_index).copied().flatten())
            .is_some()
    }

    fn send_packet(&mut self, client_index: usize, data: &[u8]) {
        let mut hub = lock(&self.hub);
        if let Some((_, link)) = hub.slot_link(self.address, client_index) {
            if link.state.is_connected() {
                link.to_client.push_back(data.to_vec());
            }
        }
    }

    fn receive_packet(&mut self, client_index: usize) -> Option<Vec<u8>> {
        let mut hub = lock(&self.hub);
        let (listener, link) = hub.slot_link(self.address, client_index)?;
        let packet = link.to_server.pop_front()?;
        link.server_last_received = listener.time;
        Some(packet)
    }

    fn disconnect_client(&mut self, client_index: usize) {
        lock(&self.hub).release_slot(self.address, client_index, ClientState::Disconnected);
    }

    fn disconnect_all_clients(&mut self) {
        let mut hub = lock(&self.hub);
        let count = hub
            .listeners
            .get(&self.address)
            .map_or(0, |listener| listener.slots.len());
        for index in 0..count {
            hub.release_slot(self.address, index, ClientState::Disconnected);
        }
    }
}

/// The connecting end of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryClient {
    hub: Arc<Mutex<Hub>>,
    link: u64,
    timeout: f64,
    time: f64,
}

impl ClientTransport for MemoryClient {
    fn state(&self) -> ClientState {
        lock(&self.hub)
            .links
            .get(&self.link)
            .map_or(ClientState::Disconnected, |link| link.state)
    }

    fn client_index(&self) -> Option<usize> {
        lock(&self.hub)
            .links
            .get(&self.link)
            .and_then(|link| link.client_index)
    }

    fn update(&mut self, time: f64) {
        self.time = time;
        let mut hub = lock(&self.hub);
        let Some(link) = hub.links.get_mut(&self.link) else {
            return;
        };
        match link.state {
            ClientState::Connecting if time - link.connect_time > self.timeout => {
                debug!("client {} timed out connecting", link.client_id);
                link.close(ClientState::TimedOut);
            }
            ClientState::Connected => match link.client_last_received {
                None => link.client_last_received = Some(time),
                Some(last) if time - last > self.timeout => {
                    debug!("client {} lost the server", link.client_id);
                    link.close(ClientState::TimedOut);
                }
                Some(_) => {}
            },
            _ => {}
        }
    }

    fn send_packet(&mut self, data: &[u8]) {
        let mut hub = lock(&self.hub);
        if let Some(link) = hub.links.get_mut(&self.link) {
            if link.state.is_connected() {
                link.to_server.push_back(data.to_vec());
            }
        }
    }

    fn receive_packet(&mut self) -> Option<Vec<u8>> {
        let mut hub = lock(&self.hub);
        let link = hub.links.get_mut(&self.link)?;
        if !link.state.is_connected() {
            return None;
        }
        let packet = link.to_client.pop_front()?;
        link.client_last_received = Some(self.time);
        Some(packet)
    }

    fn disconnect(&mut self) {
        let mut hub = lock(&self.hub);
        if let Some(link) = hub.links.get_mut(&self.link) {
            if !link.state.is_terminal() {
                link.state = ClientState::Disconnected;
                link.to_server.clear();
                link.to_client.clear();
            }
        }
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        let mut hub = lock(&self.hub);
        let Some(link) = hub.links.get_mut(&self.link) else {
            return;
        };
        if link.client_index.is_some() {
            link.state = ClientState::Disconnected;
            link.orphaned = true;
        } else {
            hub.links.remove(&self.link);
        }
    }
}
