use std::collections::VecDeque;

use log::trace;

use super::fragment::{self, Reassembly};
use super::{ChannelError, Outgoing, materialize};
use crate::config::ChannelConfig;
use crate::message::{Context, Message, MessageHandle, MessagePool};
use crate::net::packet::{ChannelEntry, ENTRY_OVERHEAD, MESSAGE_OVERHEAD, WireFragment, WireMessage};
use crate::net::sequence::{SequenceBuffer, sequence_greater_than, sequence_less_than};

#[derive(Debug)]
struct SendEntry {
    outgoing: Outgoing,
    last_sent: Option<f64>,
}

/// What went out in one packet, so its ack can be credited.
#[derive(Debug, Default)]
struct SentPacket {
    message_ids: Vec<u16>,
    fragments: Vec<(u16, u16)>,
}

/// The large message currently being sent fragment by fragment.
#[derive(Debug)]
struct BlockSend {
    message_id: u16,
    fragments: Vec<WireFragment>,
    acked: Vec<bool>,
    last_sent: Vec<Option<f64>>,
    remaining: usize,
}

impl BlockSend {
    fn new(message_id: u16, fragments: Vec<WireFragment>) -> Self {
        let count = fragments.len();
        Self {
            message_id,
            fragments,
            acked: vec![false; count],
            last_sent: vec![None; count],
            remaining: count,
        }
    }
}

/// Delivers every message exactly once, resending until acknowledged.
///
/// Ordered channels hold received messages until every earlier id has been
/// handed to the application. Unordered channels hand them over as they
/// arrive but still drop duplicates.
///
/// Large messages go out one at a time: while one is being fragmented, the
/// messages queued behind it wait.
#[derive(Debug)]
pub struct ReliableChannel {
    index: u8,
    config: ChannelConfig,
    send_queue: SequenceBuffer<SendEntry>,
    sent_packets: SequenceBuffer<SentPacket>,
    send_message_id: u16,
    oldest_unacked: u16,
    block: Option<BlockSend>,
    receive_message_id: u16,
    received: SequenceBuffer<Option<MessageHandle>>,
    ready: VecDeque<MessageHandle>,
    reassembly: Option<Reassembly>,
}

impl ReliableChannel {
    pub fn new(index: u8, config: ChannelConfig) -> Self {
        Self {
            index,
            send_queue: SequenceBuffer::new(config.send_queue_size),
            sent_packets: SequenceBuffer::new(config.sent_packet_buffer_size),
            received: SequenceBuffer::new(config.receive_queue_size),
            config,
            send_message_id: 0,
            oldest_unacked: 0,
            block: None,
            receive_message_id: 0,
            ready: VecDeque::new(),
            reassembly: None,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn can_send(&self) -> bool {
        self.send_queue.available(self.send_message_id)
    }

    pub fn send<M: Message>(
        &mut self,
        pool: &mut MessagePool<M>,
        handle: MessageHandle,
        context: Option<&Context>,
    ) {
        assert!(self.can_send(), "channel {} send queue is full", self.index);
        let id = self.send_message_id;
        let outgoing = Outgoing::encode(pool, &self.config, id, handle, context);
        self.send_queue.insert(
            id,
            SendEntry {
                outgoing,
                last_sent: None,
            },
        );
        self.send_message_id = id.wrapping_add(1);
    }

    pub fn receive(&mut self) -> Option<MessageHandle> {
        if !self.config.kind.is_ordered() {
            return self.ready.pop_front();
        }
        let handle = self.received.remove(self.receive_message_id)??;
        self.receive_message_id = self.receive_message_id.wrapping_add(1);
        Some(handle)
    }

    fn front_is_fragmented(&self) -> bool {
        self.send_queue
            .get(self.oldest_unacked)
            .is_some_and(|send| send.outgoing.is_fragmented(&self.config))
    }

    pub fn write_entry<M: Message>(
        &mut self,
        pool: &MessagePool<M>,
        sequence: u16,
        time: f64,
        budget: usize,
    ) -> Option<ChannelEntry> {
        let mut entry = ChannelEntry::new(self.index);
        let mut sent = SentPacket::default();

        if self.front_is_fragmented() {
            self.write_fragments(pool, time, budget, &mut entry, &mut sent);
        } else {
            self.write_messages(pool, time, budget, &mut entry, &mut sent);
        }

        if entry.is_empty() {
            return None;
        }
        self.sent_packets.insert(sequence, sent);
        Some(entry)
    }

    fn write_messages<M: Message>(
        &mut self,
        pool: &MessagePool<M>,
        time: f64,
        budget: usize,
        entry: &mut ChannelEntry,
        sent: &mut SentPacket,
    ) {
        let mut used = ENTRY_OVERHEAD;
        for offset in 0..self.config.send_queue_size {
            let id = self.oldest_unacked.wrapping_add(offset as u16);
            if id == self.send_message_id || used + MESSAGE_OVERHEAD > budget {
                break;
            }
            let Some(send) = self.send_queue.get_mut(id) else {
                continue;
            };
            if send.outgoing.is_fragmented(&self.config) {
                break;
            }
            if send
                .last_sent
                .is_some_and(|last| time - last < self.config.message_resend_time)
            {
                continue;
            }

            let outgoing = &send.outgoing;
            let message = WireMessage {
                id,
                message_type: outgoing.message_type,
                payload: outgoing.payload.clone(),
                block: pool.block(outgoing.handle).map(<[u8]>::to_vec),
            };
            let size = message.measure();
            if used + size > budget {
                continue;
            }

            used += size;
            send.last_sent = Some(time);
            sent.message_ids.push(id);
            entry.messages.push(message);
            if entry.messages.len() >= self.config.max_messages_per_packet {
                break;
            }
        }
    }

    fn write_fragments<M: Message>(
        &mut self,
        pool: &MessagePool<M>,
        time: f64,
        budget: usize,
        entry: &mut ChannelEntry,
        sent: &mut SentPacket,
    ) {
        if self.block.is_none() {
            let Some(send) = self.send_queue.get(self.oldest_unacked) else {
                return;
            };
            let outgoing = &send.outgoing;
            let fragments = fragment::split(
                outgoing.id,
                outgoing.message_type,
                &outgoing.payload,
                pool.block(outgoing.handle).unwrap_or_default(),
                self.config.fragment_size,
            );
            trace!(
                "channel {}: sending message {} as {} fragments",
                self.index,
                outgoing.id,
                fragments.len()
            );
            self.block = Some(BlockSend::new(outgoing.id, fragments));
        }

        let Some(block) = self.block.as_mut() else {
            return;
        };
        let mut used = ENTRY_OVERHEAD;
        for (fragment_id, fragment) in block.fragments.iter().enumerate() {
            if block.acked[fragment_id]
                || block.last_sent[fragment_id]
                    .is_some_and(|last| time - last < self.config.fragment_resend_time)
            {
                continue;
            }
            let size = fragment.measure();
            if used + size > budget {
                break;
            }
            used += size;
            block.last_sent[fragment_id] = Some(time);
            sent.fragments.push((block.message_id, fragment_id as u16));
            entry.fragments.push(fragment.clone());
        }
    }

    pub fn process_ack<M: Message>(&mut self, pool: &mut MessagePool<M>, sequence: u16) {
        let Some(sent) = self.sent_packets.remove(sequence) else {
            return;
        };

        for id in sent.message_ids {
            if let Some(send) = self.send_queue.remove(id) {
                pool.release(send.outgoing.handle);
            }
        }

        for (message_id, fragment_id) in sent.fragments {
            let Some(block) = self.block.as_mut() else {
                break;
            };
            if block.message_id != message_id {
                continue;
            }
            let fragment_id = fragment_id as usize;
            if !block.acked[fragment_id] {
                block.acked[fragment_id] = true;
                block.remaining -= 1;
            }
            if block.remaining == 0 {
                trace!("channel {}: message {} fully acked", self.index, message_id);
                self.block = None;
                if let Some(send) = self.send_queue.remove(message_id) {
                    pool.release(send.outgoing.handle);
                }
            }
        }

        while self.oldest_unacked != self.send_message_id
            && !self.send_queue.contains(self.oldest_unacked)
        {
            self.oldest_unacked = self.oldest_unacked.wrapping_add(1);
        }
    }

    /// Whether `id` is new and inside the receive window. Ids already
    /// delivered or buffered are duplicates.
    fn accept_id(&self, id: u16) -> Result<bool, ChannelError> {
        if sequence_less_than(id, self.receive_message_id) || self.received.contains(id) {
            return Ok(false);
        }
        let newest = self
            .receive_message_id
            .wrapping_add(self.config.receive_queue_size as u16 - 1);
        if sequence_greater_than(id, newest) {
            return Err(ChannelError::OutsideWindow(id));
        }
        if !self.config.kind.is_ordered() && self.ready.len() >= self.config.receive_queue_size {
            return Err(ChannelError::ReceiveQueueFull);
        }
        Ok(true)
    }

    fn deliver(&mut self, id: u16, handle: MessageHandle) {
        if self.config.kind.is_ordered() {
            self.received.insert(id, Some(handle));
            return;
        }

        self.received.insert(id, None);
        self.ready.push_back(handle);
        while self.received.remove(self.receive_message_id).is_some() {
            self.receive_message_id = self.receive_message_id.wrapping_add(1);
        }
    }

    pub fn read_entry<M: Message>(
        &mut self,
        pool: &mut MessagePool<M>,
        entry: ChannelEntry,
        context: Option<&Context>,
    ) -> Result<(), ChannelError> {
        for message in entry.messages {
            if !self.accept_id(message.id)? {
                continue;
            }
            let handle = materialize(
                pool,
                &self.config,
                message.message_type,
                &message.payload,
                message.block.as_deref(),
                context,
            )?;
            self.deliver(message.id, handle);
        }

        for fragment in entry.fragments {
            self.read_fragment(pool, fragment, context)?;
        }
        Ok(())
    }

    fn read_fragment<M: Message>(
        &mut self,
        pool: &mut MessagePool<M>,
        fragment: WireFragment,
        context: Option<&Context>,
    ) -> Result<(), ChannelError> {
        let id = fragment.message_id;
        if !self.accept_id(id)? {
            return Ok(());
        }

        // The sender moves to its next large message only once this one is
        // fully acked, so a different id replaces any partial reassembly.
        let reassembly = match self.reassembly.take() {
            Some(reassembly) if reassembly.message_id() == id => reassembly,
            _ => Reassembly::new(&fragment, &self.config, 0.0)?,
        };
        let reassembly = self.reassembly.insert(reassembly);
        if !reassembly.insert(fragment, &self.config)? {
            return Ok(());
        }

        let (payload, block) = reassembly.assemble();
        let message_type = reassembly.message_type();
        let handle = materialize(
            pool,
            &self.config,
            message_type,
            &payload,
            block.as_deref(),
            context,
        )?;
        self.reassembly = None;
        self.deliver(id, handle);
        Ok(())
    }

    pub fn reset<M: Message>(&mut self, pool: &mut MessagePool<M>) {
        for send in self.send_queue.drain() {
            pool.release(send.outgoing.handle);
        }
        for handle in self.received.drain().flatten() {
            pool.release(handle);
        }
        for handle in self.ready.drain(..) {
            pool.release(handle);
        }
        self.sent_packets.clear();
        self.send_message_id = 0;
        self.oldest_unacked = 0;
        self.receive_message_id = 0;
        self.block = None;
        self.reassembly = None;
    }
}
