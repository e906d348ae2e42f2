use std::sync::Arc;

use log::{info, warn};

use crate::arena::{Arena, ArenaUsage, Block};
use crate::config::{ClientConfig, ConfigError};
use crate::connection::Connection;
use crate::message::{Context, Message, MessageHandle, MessagePool, PoolError};
use crate::net::{
    ClientState, ClientTransport, Endpoint, NetworkSimulator, NetworkStats, ReliableEndpoint,
    SimulatorSettings,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot allocate {requested} bytes of client memory ({available} available)")]
    OutOfMemory { requested: usize, available: usize },
}

/// One connection to a server, driven by the same frame loop as the server:
/// receive, application logic, send, advance time.
pub struct Client<M: Message> {
    arena: Arena,
    pool: MessagePool<M>,
    connection: Connection,
    endpoint: Endpoint,
    simulator: Option<NetworkSimulator>,
    transport: Box<dyn ClientTransport>,
    context: Option<Arc<Context>>,
    was_connected: bool,
    time: f64,
}

impl<M: Message> Client<M> {
    pub fn new(
        allocator: &Arena,
        config: ClientConfig,
        transport: Box<dyn ClientTransport>,
        time: f64,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let arena = allocator.carve("client", config.memory).ok_or_else(|| {
            ClientError::OutOfMemory {
                requested: config.memory,
                available: allocator.usage().available(),
            }
        })?;

        let simulator = config.network_simulator.then(|| {
            NetworkSimulator::new(
                config.max_simulator_packets,
                arena.clone(),
                config.simulator_seed,
                time,
            )
        });

        Ok(Self {
            pool: MessagePool::new(config.pool, arena.clone()),
            arena,
            connection: Connection::new(config.connection),
            endpoint: Endpoint::new(config.endpoint, time),
            simulator,
            transport,
            context: None,
            was_connected: false,
            time,
        })
    }

    pub fn state(&self) -> ClientState {
        self.transport.state()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.state().is_connected()
    }

    pub fn client_index(&self) -> Option<usize> {
        self.transport.client_index()
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_context(&mut self, context: Option<Arc<Context>>) {
        self.context = context;
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.reset();
    }

    fn reset(&mut self) {
        if let Some(simulator) = &mut self.simulator {
            simulator.discard_packets();
        }
        self.connection.reset(&mut self.pool);
        self.pool.reset();
        self.arena.reset();
        self.endpoint.reset();
        self.was_connected = false;
    }

    pub fn send_packets(&mut self) {
        if !self.is_connected() {
            return;
        }
        let sequence = self.endpoint.next_packet_sequence();
        match self.connection.generate_packet(&mut self.pool, sequence, self.time) {
            Ok(payload) => {
                let Self {
                    endpoint,
                    simulator,
                    transport,
                    ..
                } = self;
                endpoint.send_packet(&payload, &mut |_, bytes| match simulator {
                    Some(simulator) if simulator.is_active() => simulator.send_packet(0, bytes),
                    _ => transport.send_packet(bytes),
                });
            }
            Err(err) => warn!("failed to build packet: {}", err),
        }

        if let Some(simulator) = &mut self.simulator {
            for (_, bytes) in simulator.receive_packets() {
                self.transport.send_packet(&bytes);
            }
        }
    }

    pub fn receive_packets(&mut self) {
        if !self.is_connected() {
            return;
        }
        let Self {
            pool,
            connection,
            endpoint,
            transport,
            context,
            time,
            ..
        } = self;

        while let Some(packet) = transport.receive_packet() {
            endpoint.receive_packet(&packet, &mut |_, payload| {
                connection
                    .process_packet(pool, payload, *time, context.as_deref())
                    .is_ok()
            });
            let acks = endpoint.take_acks();
            connection.process_acks(pool, &acks);
        }
    }

    pub fn advance_time(&mut self, time: f64) {
        self.time = time;
        self.transport.update(time);
        self.endpoint.update(time);
        self.connection.advance_time(time);
        if let Some(simulator) = &mut self.simulator {
            simulator.advance_time(time);
        }

        if let Some(err) = self.connection.error() {
            warn!("disconnecting after connection error: {}", err);
            self.disconnect();
            return;
        }

        let connected = self.is_connected();
        if connected && !self.was_connected {
            info!("connected as client {:?}", self.client_index());
            self.was_connected = true;
        } else if !connected && self.was_connected {
            info!("connection lost ({:?})", self.state());
            self.reset();
        }
    }

    pub fn create_message(&mut self, message_type: u16) -> Result<MessageHandle, PoolError> {
        self.pool.create(message_type)
    }

    pub fn message(&self, handle: MessageHandle) -> Option<&M> {
        self.pool.get(handle)
    }

    pub fn message_mut(&mut self, handle: MessageHandle) -> Option<&mut M> {
        self.pool.get_mut(handle)
    }

    pub fn message_block(&self, handle: MessageHandle) -> Option<&[u8]> {
        self.pool.block(handle)
    }

    pub fn allocate_block(&mut self, bytes: usize) -> Option<Block> {
        self.pool.allocate_block(bytes)
    }

    pub fn attach_block(&mut self, handle: MessageHandle, block: Block) {
        self.pool.attach_block(handle, block);
    }

    pub fn free_block(&mut self, block: Block) {
        self.pool.free_block(block);
    }

    pub fn can_send_message(&self, channel: usize) -> bool {
        self.connection.can_send_message(channel)
    }

    pub fn send_message(&mut self, channel: usize, handle: MessageHandle) {
        assert!(self.is_connected(), "client is not connected");
        self.connection
            .send_message(&mut self.pool, channel, handle, self.context.as_deref());
    }

    pub fn receive_message(&mut self, channel: usize) -> Option<MessageHandle> {
        self.connection.receive_message(channel)
    }

    pub fn release_message(&mut self, handle: MessageHandle) {
        self.pool.release(handle);
    }

    pub fn stats(&self) -> NetworkStats {
        self.endpoint.stats()
    }

    pub fn memory(&self) -> ArenaUsage {
        self.arena.usage()
    }

    pub fn simulator_settings(&self) -> Option<SimulatorSettings> {
        self.simulator.as_ref().map(NetworkSimulator::settings)
    }

    pub fn set_simulator_settings(&mut self, settings: SimulatorSettings) {
        if let Some(simulator) = &mut self.simulator {
            simulator.set_settings(settings);
        }
    }

    pub fn set_latency(&mut self, milliseconds: f32) {
        if let Some(simulator) = &mut self.simulator {
            simulator.set_latency(milliseconds);
        }
    }

    pub fn set_jitter(&mut self, milliseconds: f32) {
        if let Some(simulator) = &mut self.simulator {
            simulator.set_jitter(milliseconds);
        }
    }

    pub fn set_packet_loss(&mut self, percent: f32) {
        if let Some(simulator) = &mut self.simulator {
            simulator.set_packet_loss(percent);
        }
    }

    pub fn set_duplicates(&mut self, percent: f32) {
        if let Some(simulator) = &mut self.simulator {
            simulator.set_duplicates(percent);
        }
    }
}
