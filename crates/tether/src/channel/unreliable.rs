use std::collections::VecDeque;

use log::debug;

use super::fragment::{self, Reassembly};
use super::{ChannelError, Outgoing, materialize};
use crate::config::ChannelConfig;
use crate::message::{Context, Message, MessageHandle, MessagePool};
use crate::net::packet::{ChannelEntry, ENTRY_OVERHEAD, MESSAGE_OVERHEAD, WireFragment, WireMessage};

const MAX_REASSEMBLIES: usize = 8;

/// Sends each message at most once. Nothing is resent, reordered or
/// deduplicated.
#[derive(Debug)]
pub struct UnreliableChannel {
    index: u8,
    config: ChannelConfig,
    send_queue: VecDeque<Outgoing>,
    pending_fragments: VecDeque<WireFragment>,
    /// The message being fragmented. It stays referenced, and charged to the
    /// arena, until its last fragment is written.
    fragmenting: Option<MessageHandle>,
    send_message_id: u16,
    ready: VecDeque<MessageHandle>,
    reassemblies: Vec<Reassembly>,
}

impl UnreliableChannel {
    pub fn new(index: u8, config: ChannelConfig) -> Self {
        Self {
            index,
            config,
            send_queue: VecDeque::new(),
            pending_fragments: VecDeque::new(),
            fragmenting: None,
            send_message_id: 0,
            ready: VecDeque::new(),
            reassemblies: Vec::new(),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn can_send(&self) -> bool {
        self.send_queue.len() < self.config.send_queue_size
    }

    pub fn send<M: Message>(
        &mut self,
        pool: &mut MessagePool<M>,
        handle: MessageHandle,
        context: Option<&Context>,
    ) {
        assert!(self.can_send(), "channel {} send queue is full", self.index);
        let id = self.send_message_id;
        self.send_queue
            .push_back(Outgoing::encode(pool, &self.config, id, handle, context));
        self.send_message_id = id.wrapping_add(1);
    }

    pub fn receive(&mut self) -> Option<MessageHandle> {
        self.ready.pop_front()
    }

    fn write_fragments<M: Message>(
        &mut self,
        pool: &mut MessagePool<M>,
        entry: &mut ChannelEntry,
        used: &mut usize,
        budget: usize,
    ) {
        while let Some(fragment) = self.pending_fragments.front() {
            let size = fragment.measure();
            if *used + size > budget {
                break;
            }
            if let Some(fragment) = self.pending_fragments.pop_front() {
                *used += size;
                entry.fragments.push(fragment);
            }
        }
        if self.pending_fragments.is_empty() {
            if let Some(handle) = self.fragmenting.take() {
                pool.release(handle);
            }
        }
    }

    /// Moves queued messages into the packet. A message leaves the queue,
    /// and drops the channel's reference, once it has been written. Only one
    /// message is split at a time; the rest wait in the send queue.
    pub fn write_entry<M: Message>(&mut self, pool: &mut MessagePool<M>, budget: usize) -> Option<ChannelEntry> {
        let mut entry = ChannelEntry::new(self.index);
        let mut used = ENTRY_OVERHEAD;
        self.write_fragments(pool, &mut entry, &mut used, budget);

        while let Some(outgoing) = self.send_queue.front() {
            if entry.messages.len() >= self.config.max_messages_per_packet
                || used + MESSAGE_OVERHEAD > budget
            {
                break;
            }

            if outgoing.is_fragmented(&self.config) {
                if self.fragmenting.is_some() {
                    break;
                }
                let fragments = fragment::split(
                    outgoing.id,
                    outgoing.message_type,
                    &outgoing.payload,
                    pool.block(outgoing.handle).unwrap_or_default(),
                    self.config.fragment_size,
                );
                self.pending_fragments.extend(fragments);
                self.fragmenting = self.send_queue.pop_front().map(|outgoing| outgoing.handle);
                break;
            }

            let message = WireMessage {
                id: outgoing.id,
                message_type: outgoing.message_type,
                payload: outgoing.payload.clone(),
                block: pool.block(outgoing.handle).map(<[u8]>::to_vec),
            };
            let size = message.measure();
            if used + size > budget {
                break;
            }
            used += size;
            entry.messages.push(message);
            if let Some(outgoing) = self.send_queue.pop_front() {
                pool.release(outgoing.handle);
            }
        }

        self.write_fragments(pool, &mut entry, &mut used, budget);
        (!entry.is_empty()).then_some(entry)
    }

    fn push_ready(&mut self, handle: MessageHandle) {
        self.ready.push_back(handle);
    }

    fn check_capacity(&self) -> Result<(), ChannelError> {
        if self.ready.len() >= self.config.receive_queue_size {
            return Err(ChannelError::ReceiveQueueFull);
        }
        Ok(())
    }

    pub fn read_entry<M: Message>(
        &mut self,
        pool: &mut MessagePool<M>,
        entry: ChannelEntry,
        time: f64,
        context: Option<&Context>,
    ) -> Result<(), ChannelError> {
        for message in entry.messages {
            self.check_capacity()?;
            let handle = materialize(
                pool,
                &self.config,
                message.message_type,
                &message.payload,
                message.block.as_deref(),
                context,
            )?;
            self.push_ready(handle);
        }

        for fragment in entry.fragments {
            self.read_fragment(pool, fragment, time, context)?;
        }
        Ok(())
    }

    fn read_fragment<M: Message>(
        &mut self,
        pool: &mut MessagePool<M>,
        fragment: WireFragment,
        time: f64,
        context: Option<&Context>,
    ) -> Result<(), ChannelError> {
        let id = fragment.message_id;
        let position = match self.reassemblies.iter().position(|r| r.message_id() == id) {
            Some(position) => position,
            None => {
                if self.reassemblies.len() >= MAX_REASSEMBLIES {
                    self.evict_oldest();
                }
                self.reassemblies
                    .push(Reassembly::new(&fragment, &self.config, time)?);
                self.reassemblies.len() - 1
            }
        };

        if !self.reassemblies[position].insert(fragment, &self.config)? {
            return Ok(());
        }

        let reassembly = self.reassemblies.swap_remove(position);
        self.check_capacity()?;
        let (payload, block) = reassembly.assemble();
        let handle = materialize(
            pool,
            &self.config,
            reassembly.message_type(),
            &payload,
            block.as_deref(),
            context,
        )?;
        self.push_ready(handle);
        Ok(())
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .reassemblies
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.started().total_cmp(&b.started()))
            .map(|(position, _)| position);
        if let Some(position) = oldest {
            let evicted = self.reassemblies.swap_remove(position);
            debug!(
                "channel {}: evicting partial message {} to make room",
                self.index,
                evicted.message_id()
            );
        }
    }

    /// Discards partial messages older than the reassembly timeout.
    pub fn advance_time(&mut self, time: f64) {
        let timeout = self.config.reassembly_timeout;
        let index = self.index;
        self.reassemblies.retain(|reassembly| {
            let stale = reassembly.is_stale(time, timeout);
            if stale {
                debug!(
                    "channel {}: reassembly of message {} timed out",
                    index,
                    reassembly.message_id()
                );
            }
            !stale
        });
    }

    pub fn reset<M: Message>(&mut self, pool: &mut MessagePool<M>) {
        for outgoing in self.send_queue.drain(..) {
            pool.release(outgoing.handle);
        }
        for handle in self.ready.drain(..) {
            pool.release(handle);
        }
        self.pending_fragments.clear();
        if let Some(handle) = self.fragmenting.take() {
            pool.release(handle);
        }
        self.reassemblies.clear();
        self.send_message_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{Note, body, note, pool};
    use crate::config::ChannelKind;

    fn channel() -> UnreliableChannel {
        UnreliableChannel::new(1, ChannelConfig {
            send_queue_size: 8,
            receive_queue_size: 4,
            fragment_above: 128,
            fragment_size: 128,
            max_block_size: 4096,
            ..ChannelConfig::new(ChannelKind::Unreliable)
        })
    }

    fn send(channel: &mut UnreliableChannel, pool: &mut MessagePool<Note>, bytes: &[u8]) -> MessageHandle {
        let handle = note(pool, bytes);
        channel.send(pool, handle, None);
        pool.release(handle);
        handle
    }

    #[test]
    fn sends_once_and_releases() {
        let (mut tx_pool, mut rx_pool) = (pool(), pool());
        let (mut tx, mut rx) = (channel(), channel());

        let handle = send(&mut tx, &mut tx_pool, b"fire");
        let entry = tx.write_entry(&mut tx_pool, 1024).unwrap();
        assert!(!tx_pool.contains(handle));
        assert!(tx.write_entry(&mut tx_pool, 1024).is_none());

        rx.read_entry(&mut rx_pool, entry, 0.0, None).unwrap();
        let received = rx.receive().unwrap();
        assert_eq!(body(&rx_pool, received), b"fire");
    }

    #[test]
    fn leaves_what_does_not_fit_for_next_packet() {
        let mut tx_pool = pool();
        let mut tx = channel();
        send(&mut tx, &mut tx_pool, &[1; 100]);
        send(&mut tx, &mut tx_pool, &[2; 100]);

        let first = tx.write_entry(&mut tx_pool, 200).unwrap();
        assert_eq!(first.messages.len(), 1);
        let second = tx.write_entry(&mut tx_pool, 200).unwrap();
        assert_eq!(second.messages[0].payload, vec![2; 100]);
    }

    #[test]
    fn fragments_span_packets() {
        let (mut tx_pool, mut rx_pool) = (pool(), pool());
        let (mut tx, mut rx) = (channel(), channel());

        let data: Vec<u8> = (0..1000u32).map(|i| (i % 199) as u8).collect();
        let handle = note(&mut tx_pool, b"hdr");
        let block = tx_pool.arena().block_from_slice(&data).unwrap();
        tx_pool.attach_block(handle, block);
        tx.send(&mut tx_pool, handle, None);
        tx_pool.release(handle);
        assert_eq!(tx_pool.live_total(), 1);

        let mut live = Vec::new();
        while let Some(entry) = tx.write_entry(&mut tx_pool, 512) {
            live.push(tx_pool.live_total());
            rx.read_entry(&mut rx_pool, entry, 0.0, None).unwrap();
        }
        // Held until the last fragment is out.
        assert!(live.len() > 1);
        assert_eq!(live.last(), Some(&0));
        assert!(live[..live.len() - 1].iter().all(|&count| count == 1));

        let received = rx.receive().unwrap();
        assert_eq!(body(&rx_pool, received), b"hdr");
        assert_eq!(rx_pool.block(received), Some(data.as_slice()));
    }

    #[test]
    fn oversize_messages_back_up_the_send_queue() {
        let mut tx_pool = pool();
        let mut tx = channel();
        let data = vec![3; 1000];

        let mut blocked = false;
        for _ in 0..64 {
            if tx.can_send() {
                let handle = note(&mut tx_pool, b"big");
                let block = tx_pool.arena().block_from_slice(&data).unwrap();
                tx_pool.attach_block(handle, block);
                tx.send(&mut tx_pool, handle, None);
                tx_pool.release(handle);
            } else {
                blocked = true;
            }
            // Room for one fragment per packet.
            tx.write_entry(&mut tx_pool, 256);

            assert!(tx.pending_fragments.len() <= 8);
            assert!(tx_pool.arena().usage().used >= data.len());
        }
        assert!(blocked);
    }

    #[test]
    fn reset_releases_message_being_fragmented() {
        let mut tx_pool = pool();
        let mut tx = channel();
        send(&mut tx, &mut tx_pool, &[5; 600]);

        tx.write_entry(&mut tx_pool, 256).unwrap();
        assert_eq!(tx_pool.live_total(), 1);
        tx.reset(&mut tx_pool);
        assert_eq!(tx_pool.live_total(), 0);
        assert_eq!(tx_pool.arena().usage().used, 0);
    }

    #[test]
    fn partial_reassembly_times_out() {
        let (mut tx_pool, mut rx_pool) = (pool(), pool());
        let (mut tx, mut rx) = (channel(), channel());
        send(&mut tx, &mut tx_pool, &[7; 600]);

        let mut entry = tx.write_entry(&mut tx_pool, 4096).unwrap();
        let last = entry.fragments.pop().unwrap();
        rx.read_entry(&mut rx_pool, entry, 0.0, None).unwrap();

        rx.advance_time(2.0);
        let mut late = ChannelEntry::new(1);
        late.fragments.push(last);
        rx.read_entry(&mut rx_pool, late, 2.0, None).unwrap();
        assert!(rx.receive().is_none());
    }

    #[test]
    fn full_receive_queue_fails_processing() {
        let (mut tx_pool, mut rx_pool) = (pool(), pool());
        let (mut tx, mut rx) = (channel(), channel());
        for _ in 0..5 {
            send(&mut tx, &mut tx_pool, b"spam");
        }
        let entry = tx.write_entry(&mut tx_pool, 4096).unwrap();
        assert_eq!(
            rx.read_entry(&mut rx_pool, entry, 0.0, None),
            Err(ChannelError::ReceiveQueueFull)
        );
        assert_eq!(rx_pool.live_total(), 4);
    }
}
