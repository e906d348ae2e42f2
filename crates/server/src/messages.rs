use tether::{Context, Message, MessageError};

pub const SEQUENCE: u16 = 0;
pub const BLOB: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoMessage {
    Sequence { value: u32 },
    /// The attached block carries the data; the payload only its checksum.
    Blob { checksum: u32 },
}

impl Message for EchoMessage {
    fn create(message_type: u16) -> Option<Self> {
        match message_type {
            SEQUENCE => Some(Self::Sequence { value: 0 }),
            BLOB => Some(Self::Blob { checksum: 0 }),
            _ => None,
        }
    }

    fn message_type(&self) -> u16 {
        match self {
            Self::Sequence { .. } => SEQUENCE,
            Self::Blob { .. } => BLOB,
        }
    }

    fn serialize(&self, out: &mut Vec<u8>, _: Option<&Context>) {
        let (Self::Sequence { value } | Self::Blob { checksum: value }) = self;
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn deserialize(&mut self, data: &[u8], _: Option<&Context>) -> Result<(), MessageError> {
        let bytes: [u8; 4] = data.try_into().map_err(|_| MessageError::Truncated {
            needed: 4,
            available: data.len(),
        })?;
        let (Self::Sequence { value } | Self::Blob { checksum: value }) = self;
        *value = u32::from_le_bytes(bytes);
        Ok(())
    }
}

/// FNV-1a over the block bytes.
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5, |hash, &byte| {
        (hash ^ byte as u32).wrapping_mul(0x0100_0193)
    })
}

pub fn block_pattern(len: usize, seed: u32) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed) as u8)
        .collect()
}
