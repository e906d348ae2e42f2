use std::net::SocketAddr;

use anyhow::{Context as _, Result, bail};
use log::{debug, error, info, warn};
use tether::{
    Arena, Client, MemoryNetwork, Message, MessageHandle, NetworkStats, Server, ServerConfig,
    ServerEvent, ServerInterface, SimulatorSettings,
};

use crate::messages::{BLOB, EchoMessage, SEQUENCE, block_pattern, checksum};

const CHANNEL: usize = 0;
const KEY: [u8; tether::KEY_BYTES] = [0x5a; tether::KEY_BYTES];

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub address: SocketAddr,
    pub max_clients: usize,
    pub clients: usize,
    pub frames: u32,
    pub frame_rate: u32,
    pub block_size: usize,
    pub simulator: SimulatorSettings,
    pub server: ServerConfig,
}

#[derive(Debug)]
pub struct PeerReport {
    pub client_index: Option<usize>,
    pub sent: u32,
    pub echoed: u32,
    pub block_echoed: bool,
    pub violations: u32,
    pub stats: NetworkStats,
}

struct Peer {
    client: Client<EchoMessage>,
    next_value: u32,
    expected: u32,
    block: Vec<u8>,
    block_sent: bool,
    block_echoed: bool,
    violations: u32,
}

impl Peer {
    fn send(&mut self, send_until: u32) {
        if !self.client.is_connected() || !self.client.can_send_message(CHANNEL) {
            return;
        }
        if !self.block_sent && !self.block.is_empty() {
            if let Err(err) = self.send_block() {
                warn!("client {:?}: {:#}", self.client.client_index(), err);
            }
            self.block_sent = true;
            return;
        }
        if self.next_value >= send_until {
            return;
        }
        match self.client.create_message(SEQUENCE) {
            Ok(handle) => {
                if let Some(message) = self.client.message_mut(handle) {
                    *message = EchoMessage::Sequence {
                        value: self.next_value,
                    };
                }
                self.client.send_message(CHANNEL, handle);
                self.client.release_message(handle);
                self.next_value += 1;
            }
            Err(err) => debug!("client {:?}: {}", self.client.client_index(), err),
        }
    }

    fn send_block(&mut self) -> Result<()> {
        let handle = self.client.create_message(BLOB)?;
        let Some(mut block) = self.client.allocate_block(self.block.len()) else {
            self.client.release_message(handle);
            bail!("no memory for a {} byte block", self.block.len());
        };
        block.copy_from_slice(&self.block);
        if let Some(message) = self.client.message_mut(handle) {
            *message = EchoMessage::Blob {
                checksum: checksum(&self.block),
            };
        }
        self.client.attach_block(handle, block);
        self.client.send_message(CHANNEL, handle);
        self.client.release_message(handle);
        Ok(())
    }

    fn receive(&mut self) {
        while let Some(handle) = self.client.receive_message(CHANNEL) {
            match self.client.message(handle) {
                Some(EchoMessage::Sequence { value }) => {
                    if *value != self.expected {
                        error!(
                            "client {:?}: expected echo {} but got {}",
                            self.client.client_index(),
                            self.expected,
                            value
                        );
                        self.violations += 1;
                    }
                    self.expected = value + 1;
                }
                Some(EchoMessage::Blob { checksum: expected }) => {
                    let intact = self.client.message_block(handle) == Some(self.block.as_slice())
                        && checksum(&self.block) == *expected;
                    if !intact {
                        error!("client {:?}: echoed block is corrupt", self.client.client_index());
                        self.violations += 1;
                    }
                    self.block_echoed = true;
                }
                None => {}
            }
            self.client.release_message(handle);
        }
    }
}

/// Runs a server and a set of echo clients on an in-memory network.
///
/// Every client streams sequence numbers (and one large block) over a
/// reliable ordered channel; the server echoes everything back and the
/// clients check that the echoes come back complete and in order.
pub struct EchoHarness {
    config: HarnessConfig,
    allocator: Arena,
    server: Server<EchoMessage>,
    peers: Vec<Peer>,
    time: f64,
}

impl EchoHarness {
    pub fn new(config: HarnessConfig) -> Result<Self> {
        let network = MemoryNetwork::new();
        let capacity = config.server.global_memory
            + config.server.per_client_memory * (config.max_clients + config.clients);
        let allocator = Arena::new("harness", capacity);

        let mut server = Server::new(
            allocator.clone(),
            KEY,
            config.address,
            config.server.clone(),
            Box::new(network.clone()),
            0.0,
        );
        server
            .start(config.max_clients)
            .context("failed to start server")?;
        server.set_simulator_settings(config.simulator);

        let mut peers = Vec::with_capacity(config.clients);
        for id in 0..config.clients {
            let client_config = config.server.client_config();
            let transport =
                network.connect(config.address, &KEY, id as u64 + 1, &client_config, 0.0);
            let mut client = Client::new(&allocator, client_config, Box::new(transport), 0.0)
                .with_context(|| format!("failed to create client {id}"))?;
            client.set_simulator_settings(config.simulator);
            peers.push(Peer {
                client,
                next_value: 0,
                expected: 0,
                block: block_pattern(config.block_size, id as u32),
                block_sent: false,
                block_echoed: false,
                violations: 0,
            });
        }

        Ok(Self {
            config,
            allocator,
            server,
            peers,
            time: 0.0,
        })
    }

    pub fn run(&mut self) -> Result<Vec<PeerReport>> {
        let frame_time = 1.0 / self.config.frame_rate as f64;
        // Leave the last quarter of the run for stragglers.
        let send_until = self.config.frames - self.config.frames / 4;

        for frame in 0..self.config.frames {
            self.server.receive_packets();
            for peer in &mut self.peers {
                peer.client.receive_packets();
                peer.receive();
            }

            self.echo();
            for peer in &mut self.peers {
                peer.send(send_until);
            }

            self.server.send_packets();
            for peer in &mut self.peers {
                peer.client.send_packets();
            }

            self.time += frame_time;
            self.server.advance_time(self.time);
            for peer in &mut self.peers {
                peer.client.advance_time(self.time);
            }
            self.log_events(frame);
        }

        let reports = self.reports();
        self.server.stop();
        self.log_events(self.config.frames);
        debug!(
            "{} bytes still charged to the harness allocator",
            self.allocator.usage().used
        );
        Ok(reports)
    }

    fn echo(&mut self) {
        for client_index in 0..self.server.max_clients() {
            if !self.server.is_client_connected(client_index) {
                continue;
            }
            while let Some(handle) = self.server.receive_message(client_index, CHANNEL) {
                if let Err(err) = self.echo_message(client_index, handle) {
                    warn!("client {}: echo dropped: {:#}", client_index, err);
                }
                self.server.release_message(client_index, handle);
            }
        }
    }

    fn echo_message(&mut self, client_index: usize, received: MessageHandle) -> Result<()> {
        let server = &mut self.server;
        let Some(message) = server.message(client_index, received).cloned() else {
            bail!("message vanished");
        };
        let block = server
            .message_block(client_index, received)
            .map(<[u8]>::to_vec);
        if !server.can_send_message(client_index, CHANNEL) {
            bail!("channel {} is full", CHANNEL);
        }

        let handle = server.create_message(client_index, message.message_type())?;
        if let Some(bytes) = block {
            let Some(mut copy) = server.allocate_block(client_index, bytes.len()) else {
                server.release_message(client_index, handle);
                bail!("no memory for a {} byte block", bytes.len());
            };
            copy.copy_from_slice(&bytes);
            server.attach_block(client_index, handle, copy);
        }
        if let Some(slot) = server.message_mut(client_index, handle) {
            *slot = message;
        }
        server.send_message(client_index, CHANNEL, handle);
        server.release_message(client_index, handle);
        Ok(())
    }

    fn log_events(&mut self, frame: u32) {
        for event in self.server.drain_events() {
            match event {
                ServerEvent::ClientConnected { client_index } => {
                    info!("frame {}: client {} connected", frame, client_index);
                }
                ServerEvent::ClientDisconnected {
                    client_index,
                    reason,
                } => {
                    info!(
                        "frame {}: client {} {}",
                        frame,
                        client_index,
                        reason.as_str()
                    );
                }
            }
        }
    }

    fn reports(&self) -> Vec<PeerReport> {
        self.peers
            .iter()
            .map(|peer| PeerReport {
                client_index: peer.client.client_index(),
                sent: peer.next_value,
                echoed: peer.expected,
                block_echoed: peer.block_echoed,
                violations: peer.violations,
                stats: peer.client.stats(),
            })
            .collect()
    }
}
