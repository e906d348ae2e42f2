use crate::channel::{Channel, ChannelError};
use crate::config::ConnectionConfig;
use crate::message::{Context, Message, MessageHandle, MessagePool};
use crate::net::packet::{ConnectionPacket, ENTRY_OVERHEAD, PACKET_OVERHEAD, PacketError};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("malformed packet: {0}")]
    Packet(#[from] PacketError),
    #[error("packet addressed channel {0}, which does not exist")]
    InvalidChannel(usize),
    #[error("channel {channel}: {source}")]
    Channel {
        channel: usize,
        #[source]
        source: ChannelError,
    },
}

impl ConnectionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Channel { source, .. } if source.is_fatal())
    }
}

/// Multiplexes the channels of one peer into packets and back.
///
/// A fatal channel error is latched in [`Connection::error`]; the owner is
/// expected to drop the peer when it sees one.
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    channels: Vec<Channel>,
    error: Option<ConnectionError>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let channels = config
            .channels
            .iter()
            .enumerate()
            .map(|(index, channel)| Channel::new(index as u8, channel.clone()))
            .collect();
        Self {
            config,
            channels,
            error: None,
        }
    }

    pub fn error(&self) -> Option<&ConnectionError> {
        self.error.as_ref()
    }

    fn channel_mut(&mut self, channel: usize) -> &mut Channel {
        assert!(
            channel < self.channels.len(),
            "channel index {channel} out of range (connection has {})",
            self.channels.len()
        );
        &mut self.channels[channel]
    }

    pub fn can_send_message(&self, channel: usize) -> bool {
        assert!(
            channel < self.channels.len(),
            "channel index {channel} out of range (connection has {})",
            self.channels.len()
        );
        self.channels[channel].can_send()
    }

    /// Queues `handle` on `channel`. The channel takes its own reference; the
    /// caller still owns and must release theirs.
    pub fn send_message<M: Message>(
        &mut self,
        pool: &mut MessagePool<M>,
        channel: usize,
        handle: MessageHandle,
        context: Option<&Context>,
    ) {
        self.channel_mut(channel).send(pool, handle, context);
    }

    pub fn receive_message(&mut self, channel: usize) -> Option<MessageHandle> {
        self.channel_mut(channel).receive()
    }

    /// Packs pending messages of every channel into the payload of the packet
    /// numbered `sequence`. The result may carry no messages at all.
    pub fn generate_packet<M: Message>(
        &mut self,
        pool: &mut MessagePool<M>,
        sequence: u16,
        time: f64,
    ) -> Result<Vec<u8>, PacketError> {
        let mut packet = ConnectionPacket::default();
        let mut remaining = self.config.max_packet_size - PACKET_OVERHEAD;

        for channel in &mut self.channels {
            let budget = channel
                .config()
                .packet_budget
                .map_or(remaining, |budget| budget.min(remaining));
            if budget <= ENTRY_OVERHEAD {
                continue;
            }
            if let Some(entry) = channel.write_entry(pool, sequence, time, budget) {
                remaining -= entry.measure();
                packet.entries.push(entry);
            }
        }

        packet.serialize(self.config.max_packet_size)
    }

    pub fn process_packet<M: Message>(
        &mut self,
        pool: &mut MessagePool<M>,
        data: &[u8],
        time: f64,
        context: Option<&Context>,
    ) -> Result<(), ConnectionError> {
        let packet = ConnectionPacket::deserialize(data)?;
        for entry in packet.entries {
            let index = entry.channel as usize;
            let Some(channel) = self.channels.get_mut(index) else {
                return Err(ConnectionError::InvalidChannel(index));
            };
            if let Err(source) = channel.read_entry(pool, entry, time, context) {
                if source.is_fatal() && self.error.is_none() {
                    self.error = Some(ConnectionError::Channel {
                        channel: index,
                        source: source.clone(),
                    });
                }
                return Err(ConnectionError::Channel {
                    channel: index,
                    source,
                });
            }
        }
        Ok(())
    }

    pub fn process_acks<M: Message>(&mut self, pool: &mut MessagePool<M>, acks: &[u16]) {
        for &sequence in acks {
            for channel in &mut self.channels {
                channel.process_ack(pool, sequence);
            }
        }
    }

    pub fn advance_time(&mut self, time: f64) {
        for channel in &mut self.channels {
            channel.advance_time(time);
        }
    }

    /// Returns every message held by the channels to `pool` and clears any
    /// latched error.
    pub fn reset<M: Message>(&mut self, pool: &mut MessagePool<M>) {
        for channel in &mut self.channels {
            channel.reset(pool);
        }
        self.error = None;
    }
}
