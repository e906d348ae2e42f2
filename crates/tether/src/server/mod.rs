mod base;
mod dedicated;
mod events;
mod slot;

use std::sync::Arc;

pub use base::{BaseServer, ServerError};
pub use dedicated::Server;
pub use events::{DisconnectReason, ServerEvent};

use crate::arena::{ArenaUsage, Block};
use crate::message::{Context, Message, MessageHandle, PoolError};
use crate::net::{NetworkStats, SimulatorSettings};

/// The uniform server API. Implementors supply the lifecycle and packet
/// plumbing for their transport; everything that only touches client slots
/// is provided on top of [`BaseServer`].
pub trait ServerInterface<M: Message> {
    fn base(&self) -> &BaseServer<M>;
    fn base_mut(&mut self) -> &mut BaseServer<M>;

    fn start(&mut self, max_clients: usize) -> Result<(), ServerError>;
    /// Disconnects every client and releases all slots. Does nothing if the
    /// server is not running.
    fn stop(&mut self);
    fn disconnect_client(&mut self, client_index: usize);
    fn disconnect_all_clients(&mut self);
    fn send_packets(&mut self);
    fn receive_packets(&mut self);
    fn advance_time(&mut self, time: f64);

    fn is_running(&self) -> bool {
        self.base().is_running()
    }

    fn time(&self) -> f64 {
        self.base().time()
    }

    fn max_clients(&self) -> usize {
        self.base().max_clients()
    }

    fn is_client_connected(&self, client_index: usize) -> bool {
        self.base().is_client_connected(client_index)
    }

    fn num_connected_clients(&self) -> usize {
        self.base().num_connected_clients()
    }

    /// The context must match the one the peers use.
    fn set_context(&mut self, context: Option<Arc<Context>>) {
        self.base_mut().set_context(context);
    }

    fn drain_events(&mut self) -> Vec<ServerEvent> {
        self.base_mut().drain_events().collect()
    }

    /// Works on idle slots too, so messages can be prepared before the
    /// connect event is handled.
    fn create_message(&mut self, client_index: usize, message_type: u16) -> Result<MessageHandle, PoolError> {
        self.base_mut().create_message(client_index, message_type)
    }

    fn message(&self, client_index: usize, handle: MessageHandle) -> Option<&M> {
        self.base().message(client_index, handle)
    }

    fn message_mut(&mut self, client_index: usize, handle: MessageHandle) -> Option<&mut M> {
        self.base_mut().message_mut(client_index, handle)
    }

    fn message_block(&self, client_index: usize, handle: MessageHandle) -> Option<&[u8]> {
        self.base().message_block(client_index, handle)
    }

    fn allocate_block(&mut self, client_index: usize, bytes: usize) -> Option<Block> {
        self.base_mut().allocate_block(client_index, bytes)
    }

    fn attach_block(&mut self, client_index: usize, handle: MessageHandle, block: Block) {
        self.base_mut().attach_block(client_index, handle, block);
    }

    fn free_block(&mut self, client_index: usize, block: Block) {
        self.base_mut().free_block(client_index, block);
    }

    fn can_send_message(&self, client_index: usize, channel: usize) -> bool {
        self.base().can_send_message(client_index, channel)
    }

    /// Queues a message. The caller keeps its own reference and still has to
    /// release it.
    fn send_message(&mut self, client_index: usize, channel: usize, handle: MessageHandle) {
        self.base_mut().send_message(client_index, channel, handle);
    }

    fn receive_message(&mut self, client_index: usize, channel: usize) -> Option<MessageHandle> {
        self.base_mut().receive_message(client_index, channel)
    }

    fn release_message(&mut self, client_index: usize, handle: MessageHandle) {
        self.base_mut().release_message(client_index, handle);
    }

    fn client_stats(&self, client_index: usize) -> Option<NetworkStats> {
        self.base().client_stats(client_index)
    }

    fn client_memory(&self, client_index: usize) -> Option<ArenaUsage> {
        self.base().client_memory(client_index)
    }

    fn global_memory(&self) -> Option<ArenaUsage> {
        self.base().global_memory()
    }

    fn simulator_settings(&self) -> SimulatorSettings {
        self.base().simulator_settings()
    }

    fn set_simulator_settings(&mut self, settings: SimulatorSettings) {
        self.base_mut().set_simulator_settings(settings);
    }

    fn set_latency(&mut self, milliseconds: f32) {
        self.base_mut().set_latency(milliseconds);
    }

    fn set_jitter(&mut self, milliseconds: f32) {
        self.base_mut().set_jitter(milliseconds);
    }

    fn set_packet_loss(&mut self, percent: f32) {
        self.base_mut().set_packet_loss(percent);
    }

    fn set_duplicates(&mut self, percent: f32) {
        self.base_mut().set_duplicates(percent);
    }
}
