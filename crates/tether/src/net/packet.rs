use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

// Conservative upper bounds on the archived framing around each element, so
// a packet assembled within budget always serializes within budget.
pub const PACKET_OVERHEAD: usize = 32;
pub const ENTRY_OVERHEAD: usize = 32;
pub const MESSAGE_OVERHEAD: usize = 32;
pub const FRAGMENT_OVERHEAD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct WireMessage {
    pub id: u16,
    pub message_type: u16,
    pub payload: Vec<u8>,
    pub block: Option<Vec<u8>>,
}

impl WireMessage {
    pub fn measure(&self) -> usize {
        MESSAGE_OVERHEAD + self.payload.len() + self.block.as_ref().map_or(0, Vec::len)
    }
}

/// One slice of a message body (payload followed by block) too large to
/// travel inline.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct WireFragment {
    pub message_id: u16,
    pub message_type: u16,
    pub fragment_id: u16,
    pub num_fragments: u16,
    pub payload_bytes: u32,
    pub data: Vec<u8>,
}

impl WireFragment {
    pub fn measure(&self) -> usize {
        FRAGMENT_OVERHEAD + self.data.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ChannelEntry {
    pub channel: u8,
    pub messages: Vec<WireMessage>,
    pub fragments: Vec<WireFragment>,
}

impl ChannelEntry {
    pub fn new(channel: u8) -> Self {
        Self {
            channel,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.fragments.is_empty()
    }

    pub fn measure(&self) -> usize {
        ENTRY_OVERHEAD
            + self.messages.iter().map(WireMessage::measure).sum::<usize>()
            + self.fragments.iter().map(WireFragment::measure).sum::<usize>()
    }
}

/// Everything one connection puts into a single reliability-layer packet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ConnectionPacket {
    pub entries: Vec<ChannelEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("packet of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },
}

impl ConnectionPacket {
    pub fn measure(&self) -> usize {
        PACKET_OVERHEAD + self.entries.iter().map(ChannelEntry::measure).sum::<usize>()
    }

    pub fn serialize(&self, max_size: usize) -> Result<Vec<u8>, PacketError> {
        let bytes = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)?;
        if bytes.len() > max_size {
            return Err(PacketError::TooLarge {
                size: bytes.len(),
                max: max_size,
            });
        }
        Ok(bytes)
    }

    /// Validates and decodes untrusted bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
    }
}
