use std::collections::VecDeque;
use std::sync::Arc;

use log::{info, warn};

use super::events::{DisconnectReason, ServerEvent};
use super::slot::{ClientSlot, SlotState};
use crate::arena::{Arena, ArenaUsage, Block};
use crate::config::{ConfigError, MAX_CLIENTS, ServerConfig};
use crate::message::{Context, Message, MessageHandle, PoolError};
use crate::net::{NetworkSimulator, NetworkStats, SimulatorSettings};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot allocate {requested} bytes for {label} arena ({available} available)")]
    OutOfMemory {
        label: String,
        requested: usize,
        available: usize,
    },
}

/// The transport-independent half of a server: client slots, the message
/// API and the packet bridge.
///
/// Concrete servers own the transport and drive this through
/// [`BaseServer::send_packets`], [`BaseServer::process_packet`] and the
/// connect/disconnect hooks.
pub struct BaseServer<M: Message> {
    config: ServerConfig,
    allocator: Arena,
    global_arena: Option<Arena>,
    slots: Vec<ClientSlot<M>>,
    simulator: Option<NetworkSimulator>,
    simulator_settings: SimulatorSettings,
    context: Option<Arc<Context>>,
    running: bool,
    time: f64,
    max_clients: usize,
    events: VecDeque<ServerEvent>,
}

impl<M: Message> BaseServer<M> {
    /// Creates a stopped server. Arenas are carved out of `allocator` when it
    /// starts and given back when it stops.
    pub fn new(config: ServerConfig, allocator: Arena, time: f64) -> Self {
        Self {
            config,
            allocator,
            global_arena: None,
            slots: Vec::new(),
            simulator: None,
            simulator_settings: SimulatorSettings::default(),
            context: None,
            running: false,
            time,
            max_clients: 0,
            events: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    fn carve(&self, label: String, bytes: usize) -> Result<Arena, ServerError> {
        let available = self.allocator.usage().available();
        match self.allocator.carve(label.clone(), bytes) {
            Some(arena) => Ok(arena),
            None => {
                warn!("cannot allocate {} bytes for {} arena", bytes, label);
                Err(ServerError::OutOfMemory {
                    label,
                    requested: bytes,
                    available,
                })
            }
        }
    }

    pub fn start(&mut self, max_clients: usize) -> Result<(), ServerError> {
        assert!(!self.running, "server is already running");
        assert!(
            (1..=MAX_CLIENTS).contains(&max_clients),
            "max_clients {max_clients} must be between 1 and {MAX_CLIENTS}"
        );
        self.config.validate()?;

        let global_arena = self.carve("global".to_string(), self.config.global_memory)?;
        let mut slots = Vec::with_capacity(max_clients);
        for index in 0..max_clients {
            let arena = self.carve(format!("client {index}"), self.config.per_client_memory)?;
            slots.push(ClientSlot::new(index, arena, &self.config, self.time));
        }

        self.simulator = self.config.network_simulator.then(|| {
            let mut simulator = NetworkSimulator::new(
                self.config.max_simulator_packets,
                global_arena.clone(),
                self.config.simulator_seed,
                self.time,
            );
            simulator.set_settings(self.simulator_settings);
            simulator
        });
        self.global_arena = Some(global_arena);
        self.slots = slots;
        self.max_clients = max_clients;
        self.running = true;

        info!("server started with {} client slots", max_clients);
        Ok(())
    }

    /// Releases every slot and the global arena, newest first. Connected
    /// clients must already have been disconnected by the caller.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.simulator = None;
        while let Some(slot) = self.slots.pop() {
            drop(slot);
        }
        self.global_arena = None;
        self.max_clients = 0;
        self.running = false;
        info!("server stopped");
    }

    pub fn set_context(&mut self, context: Option<Arc<Context>>) {
        self.context = context;
    }

    pub fn context(&self) -> Option<&Context> {
        self.context.as_deref()
    }

    fn slot(&self, client_index: usize) -> &ClientSlot<M> {
        assert!(self.running, "server is not running");
        assert!(
            client_index < self.max_clients,
            "client index {client_index} out of range (max {})",
            self.max_clients
        );
        &self.slots[client_index]
    }

    fn slot_mut(&mut self, client_index: usize) -> &mut ClientSlot<M> {
        assert!(self.running, "server is not running");
        assert!(
            client_index < self.max_clients,
            "client index {client_index} out of range (max {})",
            self.max_clients
        );
        &mut self.slots[client_index]
    }

    fn connected_slot_mut(&mut self, client_index: usize) -> &mut ClientSlot<M> {
        let slot = self.slot_mut(client_index);
        assert!(slot.is_connected(), "client {client_index} is not connected");
        slot
    }

    pub fn is_client_connected(&self, client_index: usize) -> bool {
        assert!(
            client_index < self.max_clients,
            "client index {client_index} out of range (max {})",
            self.max_clients
        );
        self.slots[client_index].is_connected()
    }

    pub fn num_connected_clients(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_connected()).count()
    }

    /// Marks a slot connected after the transport accepted a client.
    pub fn connect_slot(&mut self, client_index: usize) {
        let slot = self.slot_mut(client_index);
        if slot.is_connected() {
            warn!("client {} connected twice", client_index);
            return;
        }
        slot.state = SlotState::Connected;
        info!("client {} connected", client_index);
        self.events
            .push_back(ServerEvent::ClientConnected { client_index });
    }

    /// Frees a connected slot, returning its arena, pool and connection to
    /// their initial state. Returns false if the slot was not connected.
    pub fn disconnect_slot(&mut self, client_index: usize, reason: DisconnectReason) -> bool {
        let slot = self.slot_mut(client_index);
        if !slot.is_connected() {
            return false;
        }
        slot.reset();
        if let Some(simulator) = &mut self.simulator {
            simulator.discard_client_packets(client_index);
        }
        info!("client {} {}", client_index, reason.as_str());
        self.events.push_back(ServerEvent::ClientDisconnected {
            client_index,
            reason,
        });
        true
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.events.drain(..)
    }

    /// Builds one packet per connected client and passes the framed bytes to
    /// `transmit(client_index, bytes)`, through the simulator when it is
    /// active.
    pub fn send_packets(&mut self, transmit: &mut dyn FnMut(usize, &[u8])) {
        if !self.running {
            return;
        }
        let time = self.time;
        let Self {
            slots, simulator, ..
        } = self;

        for slot in slots.iter_mut().filter(|slot| slot.is_connected()) {
            let index = slot.index;
            slot.send_packet(time, &mut |bytes| match simulator {
                Some(simulator) if simulator.is_active() => simulator.send_packet(index, bytes),
                _ => transmit(index, bytes),
            });
        }

        if let Some(simulator) = simulator {
            for (index, bytes) in simulator.receive_packets() {
                if slots[index].is_connected() {
                    transmit(index, &bytes);
                }
            }
        }
    }

    /// Hands one packet received from `client_index` to its slot. Returns
    /// false if it was rejected or the client is not connected.
    pub fn process_packet(&mut self, client_index: usize, data: &[u8]) -> bool {
        let time = self.time;
        let context = self.context.clone();
        let slot = self.slot_mut(client_index);
        if !slot.is_connected() {
            return false;
        }
        slot.process_packet(data, time, context.as_deref())
    }

    /// Moves the clock forward. Returns the clients whose connection hit an
    /// unrecoverable error; the caller disconnects them.
    pub fn advance_time(&mut self, time: f64) -> Vec<usize> {
        self.time = time;
        if let Some(simulator) = &mut self.simulator {
            simulator.advance_time(time);
        }

        let mut failed = Vec::new();
        for slot in self.slots.iter_mut().filter(|slot| slot.is_connected()) {
            slot.advance_time(time);
            if let Some(err) = slot.connection.error() {
                warn!("client {}: {}", slot.index, err);
                failed.push(slot.index);
            }
        }
        failed
    }

    /// Messages may be prepared on an idle slot; only sending needs a
    /// connected client. Anything left on the slot goes away on disconnect.
    pub fn create_message(&mut self, client_index: usize, message_type: u16) -> Result<MessageHandle, PoolError> {
        self.slot_mut(client_index).pool.create(message_type)
    }

    pub fn message(&self, client_index: usize, handle: MessageHandle) -> Option<&M> {
        self.slot(client_index).pool.get(handle)
    }

    pub fn message_mut(&mut self, client_index: usize, handle: MessageHandle) -> Option<&mut M> {
        self.slot_mut(client_index).pool.get_mut(handle)
    }

    pub fn message_block(&self, client_index: usize, handle: MessageHandle) -> Option<&[u8]> {
        self.slot(client_index).pool.block(handle)
    }

    pub fn allocate_block(&mut self, client_index: usize, bytes: usize) -> Option<Block> {
        self.slot_mut(client_index).pool.allocate_block(bytes)
    }

    pub fn attach_block(&mut self, client_index: usize, handle: MessageHandle, block: Block) {
        self.slot_mut(client_index).pool.attach_block(handle, block);
    }

    pub fn free_block(&mut self, client_index: usize, block: Block) {
        self.slot(client_index).pool.free_block(block);
    }

    pub fn can_send_message(&self, client_index: usize, channel: usize) -> bool {
        let slot = self.slot(client_index);
        assert!(slot.is_connected(), "client {client_index} is not connected");
        slot.connection.can_send_message(channel)
    }

    pub fn send_message(&mut self, client_index: usize, channel: usize, handle: MessageHandle) {
        let context = self.context.clone();
        let slot = self.connected_slot_mut(client_index);
        slot.connection
            .send_message(&mut slot.pool, channel, handle, context.as_deref());
    }

    pub fn receive_message(&mut self, client_index: usize, channel: usize) -> Option<MessageHandle> {
        self.connected_slot_mut(client_index)
            .connection
            .receive_message(channel)
    }

    pub fn release_message(&mut self, client_index: usize, handle: MessageHandle) {
        self.slot_mut(client_index).pool.release(handle);
    }

    pub fn client_stats(&self, client_index: usize) -> Option<NetworkStats> {
        let slot = self.slot(client_index);
        slot.is_connected().then(|| slot.endpoint.stats())
    }

    pub fn client_memory(&self, client_index: usize) -> Option<ArenaUsage> {
        self.running
            .then(|| self.slot(client_index).arena.usage())
    }

    pub fn global_memory(&self) -> Option<ArenaUsage> {
        self.global_arena.as_ref().map(Arena::usage)
    }

    pub fn simulator_settings(&self) -> SimulatorSettings {
        self.simulator_settings
    }

    /// Applies new simulator settings. Ignored when the simulator is
    /// disabled in the configuration.
    pub fn set_simulator_settings(&mut self, settings: SimulatorSettings) {
        if !self.config.network_simulator {
            return;
        }
        self.simulator_settings = settings;
        if let Some(simulator) = &mut self.simulator {
            simulator.set_settings(settings);
        }
    }

    fn update_simulator(&mut self, apply: impl FnOnce(&mut NetworkSimulator)) {
        if let Some(simulator) = &mut self.simulator {
            apply(simulator);
            self.simulator_settings = simulator.settings();
        }
    }

    pub fn set_latency(&mut self, milliseconds: f32) {
        self.update_simulator(|simulator| simulator.set_latency(milliseconds));
    }

    pub fn set_jitter(&mut self, milliseconds: f32) {
        self.update_simulator(|simulator| simulator.set_jitter(milliseconds));
    }

    pub fn set_packet_loss(&mut self, percent: f32) {
        self.update_simulator(|simulator| simulator.set_packet_loss(percent));
    }

    pub fn set_duplicates(&mut self, percent: f32) {
        self.update_simulator(|simulator| simulator.set_duplicates(percent));
    }
}
