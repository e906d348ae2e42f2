use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::net::packet::{ENTRY_OVERHEAD, FRAGMENT_OVERHEAD, MESSAGE_OVERHEAD, PACKET_OVERHEAD};

/// Hard upper bound on client slots a server can allocate.
pub const MAX_CLIENTS: usize = 64;
/// Upper bound on channels per connection. Channel indices travel as a `u8`.
pub const MAX_CHANNELS: usize = 64;
pub const KEY_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("a connection needs between 1 and 64 channels, got {0}")]
    ChannelCount(usize),
    #[error("channel {channel}: {reason}")]
    Channel { channel: usize, reason: &'static str },
    #[error("max packet size {0} is too small to carry a single message")]
    PacketSize(usize),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0} must be a power of two no larger than 32768")]
    SequenceWindow(&'static str),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    #[default]
    ReliableOrdered,
    ReliableUnordered,
    Unreliable,
}

impl ChannelKind {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Self::Unreliable)
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::ReliableOrdered)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub send_queue_size: usize,
    pub receive_queue_size: usize,
    pub sent_packet_buffer_size: usize,
    pub max_messages_per_packet: usize,
    /// Optional cap on bytes this channel may use in any single packet.
    pub packet_budget: Option<usize>,
    /// Seconds before an unacked reliable message is included again.
    pub message_resend_time: f64,
    /// Seconds before an unacked fragment is included again.
    pub fragment_resend_time: f64,
    /// Messages whose payload plus block exceed this many bytes are fragmented.
    pub fragment_above: usize,
    pub fragment_size: usize,
    /// Largest payload plus block a single message may carry.
    pub max_block_size: usize,
    /// Seconds an unreliable partial reassembly is kept before being discarded.
    pub reassembly_timeout: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::ReliableOrdered,
            send_queue_size: 1024,
            receive_queue_size: 1024,
            sent_packet_buffer_size: 1024,
            max_messages_per_packet: 256,
            packet_budget: None,
            message_resend_time: 0.1,
            fragment_resend_time: 0.25,
            fragment_above: 1024,
            fragment_size: 1024,
            max_block_size: 256 * 1024,
            reassembly_timeout: 1.0,
        }
    }
}

impl ChannelConfig {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn max_fragments(&self) -> usize {
        self.max_block_size.div_ceil(self.fragment_size)
    }

    fn validate(&self, channel: usize, max_packet_size: usize) -> Result<(), ConfigError> {
        let invalid = |reason| ConfigError::Channel { channel, reason };

        if !is_sequence_window(self.send_queue_size)
            || !is_sequence_window(self.receive_queue_size)
            || !is_sequence_window(self.sent_packet_buffer_size)
        {
            return Err(ConfigError::SequenceWindow("channel queue sizes"));
        }
        if self.max_messages_per_packet == 0 {
            return Err(invalid("max_messages_per_packet must be positive"));
        }
        if self.fragment_size == 0 || self.max_block_size == 0 {
            return Err(invalid("fragment and block sizes must be positive"));
        }
        if self.fragment_above > self.max_block_size {
            return Err(invalid("fragment_above exceeds max_block_size"));
        }
        if self.max_fragments() > u16::MAX as usize {
            return Err(invalid("max_block_size needs more than 65535 fragments"));
        }

        let budget = self.packet_budget.unwrap_or(max_packet_size).min(max_packet_size);
        let room = budget.saturating_sub(PACKET_OVERHEAD + ENTRY_OVERHEAD);
        if self.fragment_above + MESSAGE_OVERHEAD > room {
            return Err(invalid("fragment_above does not fit in a packet"));
        }
        if self.fragment_size + FRAGMENT_OVERHEAD > room {
            return Err(invalid("fragment_size does not fit in a packet"));
        }
        if self.message_resend_time < 0.0
            || self.fragment_resend_time < 0.0
            || self.reassembly_timeout <= 0.0
        {
            return Err(invalid("timers must not be negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_packet_size: usize,
    pub channels: Vec<ChannelConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 8 * 1024,
            channels: vec![
                ChannelConfig::new(ChannelKind::ReliableOrdered),
                ChannelConfig::new(ChannelKind::Unreliable),
            ],
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() || self.channels.len() > MAX_CHANNELS {
            return Err(ConfigError::ChannelCount(self.channels.len()));
        }
        if self.max_packet_size <= PACKET_OVERHEAD + ENTRY_OVERHEAD + MESSAGE_OVERHEAD {
            return Err(ConfigError::PacketSize(self.max_packet_size));
        }
        for (index, channel) in self.channels.iter().enumerate() {
            channel.validate(index, self.max_packet_size)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub default_capacity: usize,
    pub per_type: BTreeMap<u16, usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            per_type: BTreeMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn capacity_for(&self, message_type: u16) -> usize {
        self.per_type
            .get(&message_type)
            .copied()
            .unwrap_or(self.default_capacity)
    }

    pub fn with_capacity(mut self, message_type: u16, capacity: usize) -> Self {
        self.per_type.insert(message_type, capacity);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub sent_packets_buffer_size: usize,
    pub received_packets_buffer_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            sent_packets_buffer_size: 256,
            received_packets_buffer_size: 256,
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // The ack bitfield covers 32 packets behind the latest one.
        if !is_sequence_window(self.sent_packets_buffer_size)
            || !is_sequence_window(self.received_packets_buffer_size)
            || self.received_packets_buffer_size < 64
        {
            return Err(ConfigError::SequenceWindow("endpoint packet buffers (min 64)"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub protocol_id: u64,
    pub timeout_secs: f64,
    pub global_memory: usize,
    pub per_client_memory: usize,
    pub network_simulator: bool,
    pub max_simulator_packets: usize,
    pub simulator_seed: u64,
    pub pool: PoolConfig,
    pub connection: ConnectionConfig,
    pub endpoint: EndpointConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol_id: 0,
            timeout_secs: 5.0,
            global_memory: 10 * 1024 * 1024,
            per_client_memory: 10 * 1024 * 1024,
            network_simulator: true,
            max_simulator_packets: 4 * 1024,
            simulator_seed: 0,
            pool: PoolConfig::default(),
            connection: ConnectionConfig::default(),
            endpoint: EndpointConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.per_client_memory == 0 {
            return Err(ConfigError::Zero("per_client_memory"));
        }
        if self.global_memory == 0 {
            return Err(ConfigError::Zero("global_memory"));
        }
        if self.timeout_secs <= 0.0 {
            return Err(ConfigError::Zero("timeout_secs"));
        }
        if self.network_simulator && self.max_simulator_packets == 0 {
            return Err(ConfigError::Zero("max_simulator_packets"));
        }
        self.connection.validate()?;
        self.endpoint.validate()
    }

    /// The matching settings for a client talking to this server.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            protocol_id: self.protocol_id,
            timeout_secs: self.timeout_secs,
            memory: self.per_client_memory,
            network_simulator: self.network_simulator,
            max_simulator_packets: self.max_simulator_packets,
            simulator_seed: self.simulator_seed,
            pool: self.pool.clone(),
            connection: self.connection.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub protocol_id: u64,
    pub timeout_secs: f64,
    pub memory: usize,
    pub network_simulator: bool,
    pub max_simulator_packets: usize,
    pub simulator_seed: u64,
    pub pool: PoolConfig,
    pub connection: ConnectionConfig,
    pub endpoint: EndpointConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ServerConfig::default().client_config()
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory == 0 {
            return Err(ConfigError::Zero("memory"));
        }
        if self.timeout_secs <= 0.0 {
            return Err(ConfigError::Zero("timeout_secs"));
        }
        if self.network_simulator && self.max_simulator_packets == 0 {
            return Err(ConfigError::Zero("max_simulator_packets"));
        }
        self.connection.validate()?;
        self.endpoint.validate()
    }
}

fn is_sequence_window(size: usize) -> bool {
    size.is_power_of_two() && size <= 32768
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(ServerConfig::default().validate(), Ok(()));
        assert_eq!(ClientConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_empty_channel_list() {
        let mut config = ConnectionConfig::default();
        config.channels.clear();
        assert_eq!(config.validate(), Err(ConfigError::ChannelCount(0)));
    }

    #[test]
    fn rejects_fragment_larger_than_packet() {
        let mut config = ConnectionConfig {
            max_packet_size: 512,
            ..Default::default()
        };
        for channel in &mut config.channels {
            channel.fragment_above = 256;
        }
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Channel { channel: 0, .. })
        ));
    }

    #[test]
    fn rejects_odd_queue_sizes() {
        let mut config = ConnectionConfig::default();
        config.channels[0].receive_queue_size = 1000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SequenceWindow(_))
        ));
    }

    #[test]
    fn per_type_pool_capacity_overrides_default() {
        let pool = PoolConfig::default().with_capacity(3, 2);
        assert_eq!(pool.capacity_for(3), 2);
        assert_eq!(pool.capacity_for(4), 1024);
    }
}
