use super::ChannelError;
use crate::config::ChannelConfig;
use crate::net::packet::WireFragment;

/// Splits a message body (payload followed by block) into wire fragments.
pub fn split(
    message_id: u16,
    message_type: u16,
    payload: &[u8],
    block: &[u8],
    fragment_size: usize,
) -> Vec<WireFragment> {
    let mut body = Vec::with_capacity(payload.len() + block.len());
    body.extend_from_slice(payload);
    body.extend_from_slice(block);

    let num_fragments = body.len().div_ceil(fragment_size).max(1);
    assert!(
        num_fragments <= u16::MAX as usize,
        "message body of {} bytes needs too many fragments",
        body.len()
    );

    (0..num_fragments)
        .map(|fragment_id| {
            let start = fragment_id * fragment_size;
            let end = (start + fragment_size).min(body.len());
            WireFragment {
                message_id,
                message_type,
                fragment_id: fragment_id as u16,
                num_fragments: num_fragments as u16,
                payload_bytes: payload.len() as u32,
                data: body[start..end].to_vec(),
            }
        })
        .collect()
}

fn validate(fragment: &WireFragment, config: &ChannelConfig) -> Result<(), ChannelError> {
    let num_fragments = fragment.num_fragments as usize;
    if num_fragments == 0 || num_fragments > config.max_fragments() {
        return Err(ChannelError::InvalidFragment("fragment count out of range"));
    }
    if fragment.fragment_id >= fragment.num_fragments {
        return Err(ChannelError::InvalidFragment("fragment id out of range"));
    }
    if fragment.payload_bytes as usize > config.max_block_size {
        return Err(ChannelError::InvalidFragment("payload larger than max block size"));
    }
    let last = fragment.fragment_id + 1 == fragment.num_fragments;
    let len = fragment.data.len();
    if len > config.fragment_size || (!last && len != config.fragment_size) {
        return Err(ChannelError::InvalidFragment("fragment has the wrong size"));
    }
    Ok(())
}

/// A large message being rebuilt from its fragments.
#[derive(Debug)]
pub struct Reassembly {
    message_id: u16,
    message_type: u16,
    payload_bytes: usize,
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
    started: f64,
}

impl Reassembly {
    pub fn new(fragment: &WireFragment, config: &ChannelConfig, time: f64) -> Result<Self, ChannelError> {
        validate(fragment, config)?;
        Ok(Self {
            message_id: fragment.message_id,
            message_type: fragment.message_type,
            payload_bytes: fragment.payload_bytes as usize,
            fragments: vec![None; fragment.num_fragments as usize],
            received: 0,
            started: time,
        })
    }

    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn message_type(&self) -> u16 {
        self.message_type
    }

    pub fn started(&self) -> f64 {
        self.started
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.fragments.len()
    }

    pub fn is_stale(&self, time: f64, timeout: f64) -> bool {
        time - self.started > timeout
    }

    /// Stores a fragment and reports whether the message is now complete.
    /// Fragments already received are ignored.
    pub fn insert(&mut self, fragment: WireFragment, config: &ChannelConfig) -> Result<bool, ChannelError> {
        validate(&fragment, config)?;
        if fragment.message_type != self.message_type
            || fragment.num_fragments as usize != self.fragments.len()
            || fragment.payload_bytes as usize != self.payload_bytes
        {
            return Err(ChannelError::InvalidFragment("fragment header disagrees with reassembly"));
        }

        let slot = &mut self.fragments[fragment.fragment_id as usize];
        if slot.is_none() {
            *slot = Some(fragment.data);
            self.received += 1;
        }

        if !self.is_complete() {
            return Ok(false);
        }
        let total: usize = self.fragments.iter().flatten().map(Vec::len).sum();
        if total > config.max_block_size || self.payload_bytes > total {
            return Err(ChannelError::InvalidFragment("reassembled body has the wrong size"));
        }
        Ok(true)
    }

    /// The reassembled payload and, if any bytes follow it, the block.
    pub fn assemble(&self) -> (Vec<u8>, Option<Vec<u8>>) {
        let mut body: Vec<u8> = self.fragments.iter().flatten().flatten().copied().collect();
        let block = body.split_off(self.payload_bytes.min(body.len()));
        (body, (!block.is_empty()).then_some(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChannelConfig {
        ChannelConfig {
            fragment_size: 8,
            max_block_size: 64,
            ..Default::default()
        }
    }

    #[test]
    fn split_and_reassemble_out_of_order() {
        let block: Vec<u8> = (0..30).collect();
        let mut fragments = split(5, 2, b"head", &block, 8);
        assert_eq!(fragments.len(), 5);
        assert_eq!(fragments[4].data.len(), 2);

        fragments.reverse();
        let config = config();
        let mut reassembly = Reassembly::new(&fragments[0], &config, 0.0).unwrap();
        let mut complete = false;
        for fragment in fragments.clone().into_iter().chain(fragments) {
            complete = reassembly.insert(fragment, &config).unwrap();
        }
        assert!(complete);

        let (payload, assembled) = reassembly.assemble();
        assert_eq!(payload, b"head");
        assert_eq!(assembled, Some(block));
    }

    #[test]
    fn rejects_inconsistent_fragments() {
        let config = config();
        let fragments = split(1, 0, &[], &[9; 20], 8);
        let mut reassembly = Reassembly::new(&fragments[0], &config, 0.0).unwrap();

        let mut wrong_count = fragments[1].clone();
        wrong_count.num_fragments = 4;
        assert!(reassembly.insert(wrong_count, &config).is_err());

        let mut short = fragments[0].clone();
        short.data.truncate(3);
        assert!(reassembly.insert(short, &config).is_err());

        let mut too_many = fragments[0].clone();
        too_many.num_fragments = 100;
        assert!(Reassembly::new(&too_many, &config, 0.0).is_err());
    }

    #[test]
    fn goes_stale_after_timeout() {
        let fragments = split(1, 0, &[1; 10], &[], 8);
        let reassembly = Reassembly::new(&fragments[0], &config(), 2.0).unwrap();
        assert!(!reassembly.is_stale(2.5, 1.0));
        assert!(reassembly.is_stale(3.5, 1.0));
    }
}
