use log::{debug, warn};

use crate::arena::Arena;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::message::{Context, Message, MessagePool};
use crate::net::{Endpoint, ReliableEndpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Free,
    Connected,
}

/// Everything the server keeps for one potential client. Nothing in here is
/// shared with any other slot.
pub(crate) struct ClientSlot<M: Message> {
    pub index: usize,
    pub state: SlotState,
    pub arena: Arena,
    pub pool: MessagePool<M>,
    pub connection: Connection,
    pub endpoint: Box<dyn ReliableEndpoint>,
}

impl<M: Message> ClientSlot<M> {
    pub fn new(index: usize, arena: Arena, config: &ServerConfig, time: f64) -> Self {
        Self {
            index,
            state: SlotState::Free,
            pool: MessagePool::new(config.pool.clone(), arena.clone()),
            arena,
            connection: Connection::new(config.connection.clone()),
            endpoint: Box::new(Endpoint::new(config.endpoint.clone(), time)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SlotState::Connected
    }

    /// Returns the slot to its freshly started state, reclaiming its whole
    /// arena.
    pub fn reset(&mut self) {
        self.connection.reset(&mut self.pool);
        self.pool.reset();
        self.arena.reset();
        self.endpoint.reset();
        self.state = SlotState::Free;
    }

    /// Builds this frame's packet and hands the framed bytes to `transmit`.
    pub fn send_packet(&mut self, time: f64, transmit: &mut dyn FnMut(&[u8])) {
        let sequence = self.endpoint.next_packet_sequence();
        let payload = match self.connection.generate_packet(&mut self.pool, sequence, time) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("client {}: failed to build packet: {}", self.index, err);
                return;
            }
        };
        self.endpoint
            .send_packet(&payload, &mut |_, bytes| transmit(bytes));
    }

    /// Feeds one received packet through the reliability layer into the
    /// connection. Returns false if the packet was rejected.
    pub fn process_packet(&mut self, data: &[u8], time: f64, context: Option<&Context>) -> bool {
        let Self {
            index,
            endpoint,
            connection,
            pool,
            ..
        } = self;

        let accepted = endpoint.receive_packet(data, &mut |sequence, payload| {
            match connection.process_packet(pool, payload, time, context) {
                Ok(()) => true,
                Err(err) => {
                    debug!("client {}: rejected packet {}: {}", index, sequence, err);
                    false
                }
            }
        });

        let acks = endpoint.take_acks();
        connection.process_acks(pool, &acks);
        accepted
    }

    pub fn advance_time(&mut self, time: f64) {
        self.endpoint.update(time);
        self.connection.advance_time(time);
    }
}
