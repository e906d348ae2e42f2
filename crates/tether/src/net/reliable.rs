use log::trace;

use super::sequence::{SequenceBuffer, sequence_greater_than, sequence_less_than};
use super::stats::{NetworkStats, RttEstimator};
use crate::config::EndpointConfig;

const PACKET_PREFIX: u8 = 0x5e;
pub const HEADER_BYTES: usize = 9;
const LOSS_SMOOTHING: f32 = 0.1;

/// The reliability layer under one connection.
///
/// It numbers outgoing packets, tells the peer which packets arrived and
/// reports which of our packets the peer acknowledged. Payloads pass through
/// untouched: `transmit` receives the framed bytes to put on the wire and
/// `process` receives the payload of each new packet, returning whether it
/// was accepted. Rejected packets are not acknowledged.
pub trait ReliableEndpoint: Send {
    fn next_packet_sequence(&self) -> u16;

    fn send_packet(&mut self, payload: &[u8], transmit: &mut dyn FnMut(u16, &[u8]));

    fn receive_packet(
        &mut self,
        data: &[u8],
        process: &mut dyn FnMut(u16, &[u8]) -> bool,
    ) -> bool;

    fn update(&mut self, time: f64);

    /// Sequences of our packets acknowledged since the last call.
    fn take_acks(&mut self) -> Vec<u16>;

    fn reset(&mut self);

    fn stats(&self) -> NetworkStats;
}

#[derive(Debug, Clone, Copy)]
struct SentPacket {
    time: f64,
    acked: bool,
}

#[derive(Debug)]
pub struct Endpoint {
    config: EndpointConfig,
    time: f64,
    sequence: u16,
    latest_received: Option<u16>,
    sent: SequenceBuffer<SentPacket>,
    received: SequenceBuffer<f64>,
    acks: Vec<u16>,
    rtt: RttEstimator,
    stats: NetworkStats,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, time: f64) -> Self {
        Self {
            sent: SequenceBuffer::new(config.sent_packets_buffer_size),
            received: SequenceBuffer::new(config.received_packets_buffer_size),
            config,
            time,
            sequence: 0,
            latest_received: None,
            acks: Vec::new(),
            rtt: RttEstimator::default(),
            stats: NetworkStats::default(),
        }
    }

    /// Bit `i` acknowledges sequence `ack - i`.
    fn ack_data(&self) -> (u16, u32) {
        let Some(ack) = self.latest_received else {
            return (0, 0);
        };
        let mut ack_bits = 0u32;
        for i in 0..32u16 {
            if self.received.contains(ack.wrapping_sub(i)) {
                ack_bits |= 1 << i;
            }
        }
        (ack, ack_bits)
    }

    fn process_acks(&mut self, ack: u16, ack_bits: u32) {
        for i in 0..32u16 {
            if ack_bits & (1 << i) == 0 {
                continue;
            }
            let sequence = ack.wrapping_sub(i);
            if let Some(sent) = self.sent.get_mut(sequence) {
                if sent.acked {
                    continue;
                }
                sent.acked = true;
                let rtt_ms = ((self.time - sent.time) * 1000.0) as f32;
                self.acks.push(sequence);
                self.stats.packets_acked += 1;
                self.rtt.update(rtt_ms.max(0.0));
            }
        }
    }

    fn update_packet_loss(&mut self) {
        // Only judge packets old enough that their ack should have arrived.
        let horizon = self.time - (2.0 * self.rtt.srtt() as f64 / 1000.0 + 0.1);
        let (mut settled, mut lost) = (0u32, 0u32);
        for (_, sent) in self.sent.iter() {
            if sent.time <= horizon {
                settled += 1;
                if !sent.acked {
                    lost += 1;
                }
            }
        }
        if settled > 0 {
            let sample = lost as f32 / settled as f32 * 100.0;
            self.stats.packet_loss_percent +=
                (sample - self.stats.packet_loss_percent) * LOSS_SMOOTHING;
        }
    }
}

fn write_header(sequence: u16, ack: u16, ack_bits: u32, out: &mut Vec<u8>) {
    out.push(PACKET_PREFIX);
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(&ack.to_le_bytes());
    out.extend_from_slice(&ack_bits.to_le_bytes());
}

fn read_header(data: &[u8]) -> Option<(u16, u16, u32)> {
    if data.len() < HEADER_BYTES || data[0] != PACKET_PREFIX {
        return None;
    }
    let sequence = u16::from_le_bytes([data[1], data[2]]);
    let ack = u16::from_le_bytes([data[3], data[4]]);
    let ack_bits = u32::from_le_bytes([data[5], data[6], data[7], data[8]]);
    Some((sequence, ack, ack_bits))
}

impl ReliableEndpoint for Endpoint {
    fn next_packet_sequence(&self) -> u16 {
        self.sequence
    }

    fn send_packet(&mut self, payload: &[u8], transmit: &mut dyn FnMut(u16, &[u8])) {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let (ack, ack_bits) = self.ack_data();
        let mut packet = Vec::with_capacity(HEADER_BYTES + payload.len());
        write_header(sequence, ack, ack_bits, &mut packet);
        packet.extend_from_slice(payload);

        self.sent.insert(
            sequence,
            SentPacket {
                time: self.time,
                acked: false,
            },
        );
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += packet.len() as u64;

        transmit(sequence, &packet);
    }

    fn receive_packet(
        &mut self,
        data: &[u8],
        process: &mut dyn FnMut(u16, &[u8]) -> bool,
    ) -> bool {
        let Some((sequence, ack, ack_bits)) = read_header(data) else {
            self.stats.packets_invalid += 1;
            trace!("dropping packet with invalid reliability header ({} bytes)", data.len());
            return false;
        };

        if let Some(latest) = self.latest_received {
            let window = self.received.capacity() as u16;
            let oldest = latest.wrapping_sub(window - 1);
            if sequence_less_than(sequence, oldest) {
                self.stats.packets_stale += 1;
                trace!("dropping stale packet {} (latest {})", sequence, latest);
                return false;
            }
        }

        if self.received.contains(sequence) {
            self.stats.packets_duplicate += 1;
            self.process_acks(ack, ack_bits);
            return true;
        }

        if !process(sequence, &data[HEADER_BYTES..]) {
            return false;
        }

        self.received.insert(sequence, self.time);
        if self
            .latest_received
            .is_none_or(|latest| sequence_greater_than(sequence, latest))
        {
            self.latest_received = Some(sequence);
        }
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;

        self.process_acks(ack, ack_bits);
        true
    }

    fn update(&mut self, time: f64) {
        self.time = time;
        self.update_packet_loss();
    }

    fn take_acks(&mut self) -> Vec<u16> {
        std::mem::take(&mut self.acks)
    }

    fn reset(&mut self) {
        *self = Self::new(self.config.clone(), self.time);
    }

    fn stats(&self) -> NetworkStats {
        NetworkStats {
            rtt_ms: self.rtt.srtt(),
            rtt_variance: self.rtt.rtt_var(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new(EndpointConfig::default(), 0.0)
    }

    fn send(endpoint: &mut Endpoint, payload: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        endpoint.send_packet(payload, &mut |_, bytes| wire = bytes.to_vec());
        wire
    }

    #[test]
    fn payload_passes_through_with_sequence() {
        let mut a = endpoint();
        let mut b = endpoint();

        let first = send(&mut a, b"hello");
        let second = send(&mut a, b"world");

        let mut seen = Vec::new();
        assert!(b.receive_packet(&second, &mut |seq, payload| {
            seen.push((seq, payload.to_vec()));
            true
        }));
        assert!(b.receive_packet(&first, &mut |seq, payload| {
            seen.push((seq, payload.to_vec()));
            true
        }));

        assert_eq!(seen, vec![(1, b"world".to_vec()), (0, b"hello".to_vec())]);
    }

    #[test]
    fn acks_flow_back_to_sender() {
        let mut a = endpoint();
        let mut b = endpoint();

        for _ in 0..3 {
            let wire = send(&mut a, b"x");
            b.receive_packet(&wire, &mut |_, _| true);
        }

        let reply = send(&mut b, b"ack");
        a.update(0.05);
        assert!(a.receive_packet(&reply, &mut |_, _| true));

        let mut acks = a.take_acks();
        acks.sort();
        assert_eq!(acks, vec![0, 1, 2]);
        assert!(a.take_acks().is_empty());
        assert_eq!(a.stats().packets_acked, 3);
        assert!(a.stats().rtt_ms > 0.0);
    }

    #[test]
    fn nothing_acked_before_first_receive() {
        let mut a = endpoint();
        let mut b = endpoint();

        send(&mut a, b"lost");
        let reply = send(&mut b, b"hi");
        a.receive_packet(&reply, &mut |_, _| true);

        assert!(a.take_acks().is_empty());
    }

    #[test]
    fn test_duplicate_detection() {
        let mut a = endpoint();
        let mut b = endpoint();

        let wire = send(&mut a, b"once");
        let mut processed = 0;
        assert!(b.receive_packet(&wire, &mut |_, _| {
            processed += 1;
            true
        }));
        assert!(b.receive_packet(&wire, &mut |_, _| {
            processed += 1;
            true
        }));

        assert_eq!(processed, 1);
        assert_eq!(b.stats().packets_duplicate, 1);
    }

    #[test]
    fn rejected_packet_is_not_acked() {
        let mut a = endpoint();
        let mut b = endpoint();

        let wire = send(&mut a, b"bad");
        assert!(!b.receive_packet(&wire, &mut |_, _| false));

        let reply = send(&mut b, b"reply");
        a.receive_packet(&reply, &mut |_, _| true);
        assert!(a.take_acks().is_empty());

        // A retry of the same packet is processed again.
        assert!(b.receive_packet(&wire, &mut |_, _| true));
    }

    #[test]
    fn stale_and_invalid_packets_are_dropped() {
        let mut a = endpoint();
        let mut b = endpoint();

        let old = send(&mut a, b"old");
        for _ in 0..300 {
            let wire = send(&mut a, b"new");
            b.receive_packet(&wire, &mut |_, _| true);
        }

        assert!(!b.receive_packet(&old, &mut |_, _| true));
        assert!(!b.receive_packet(&[1, 2, 3], &mut |_, _| true));
        assert_eq!(b.stats().packets_stale, 1);
        assert_eq!(b.stats().packets_invalid, 1);
    }
}
