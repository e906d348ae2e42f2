use std::cmp::Ordering;
use std::collections::BinaryHeap;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::arena::{Arena, Lease};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    pub latency_ms: f32,
    pub jitter_ms: f32,
    pub loss_percent: f32,
    pub duplicate_percent: f32,
}

impl SimulatorSettings {
    pub fn is_active(&self) -> bool {
        self.latency_ms > 0.0
            || self.jitter_ms > 0.0
            || self.loss_percent > 0.0
            || self.duplicate_percent > 0.0
    }
}

#[derive(Debug)]
struct DelayedPacket {
    delivery_time: f64,
    order: u64,
    client_index: usize,
    data: Vec<u8>,
    _lease: Lease,
}

impl PartialEq for DelayedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DelayedPacket {}

impl PartialOrd for DelayedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .delivery_time
            .total_cmp(&self.delivery_time)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Delays, drops and duplicates packets on the caller's clock.
///
/// Delays are drawn uniformly from `latency ± jitter` (never below zero).
/// A packet that survives the loss draw may be duplicated; the copy gets its
/// own delay, so the two can arrive in either order.
#[derive(Debug)]
pub struct NetworkSimulator {
    settings: SimulatorSettings,
    rng: StdRng,
    arena: Arena,
    max_packets: usize,
    queue: BinaryHeap<DelayedPacket>,
    time: f64,
    order: u64,
}

impl NetworkSimulator {
    pub fn new(max_packets: usize, arena: Arena, seed: u64, time: f64) -> Self {
        Self {
            settings: SimulatorSettings::default(),
            rng: StdRng::seed_from_u64(seed),
            arena,
            max_packets,
            queue: BinaryHeap::new(),
            time,
            order: 0,
        }
    }

    pub fn settings(&self) -> SimulatorSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: SimulatorSettings) {
        self.settings = settings;
    }

    pub fn set_latency(&mut self, milliseconds: f32) {
        self.settings.latency_ms = milliseconds.max(0.0);
    }

    pub fn set_jitter(&mut self, milliseconds: f32) {
        self.settings.jitter_ms = milliseconds.max(0.0);
    }

    pub fn set_packet_loss(&mut self, percent: f32) {
        self.settings.loss_percent = percent.clamp(0.0, 100.0);
    }

    pub fn set_duplicates(&mut self, percent: f32) {
        self.settings.duplicate_percent = percent.clamp(0.0, 100.0);
    }

    pub fn is_active(&self) -> bool {
        self.settings.is_active()
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    fn roll(&mut self, percent: f32) -> bool {
        percent > 0.0 && self.rng.gen_range(0.0..100.0f32) < percent
    }

    fn delay(&mut self) -> f64 {
        let SimulatorSettings {
            latency_ms,
            jitter_ms,
            ..
        } = self.settings;
        let jitter = if jitter_ms > 0.0 {
            self.rng.gen_range(-jitter_ms..=jitter_ms)
        } else {
            0.0
        };
        (latency_ms + jitter).max(0.0) as f64 / 1000.0
    }

    fn schedule(&mut self, client_index: usize, data: &[u8]) {
        if self.queue.len() >= self.max_packets {
            debug!("simulator full, dropping packet for client {}", client_index);
            return;
        }
        let Some(lease) = self.arena.reserve(data.len()) else {
            debug!("simulator out of memory, dropping packet for client {}", client_index);
            return;
        };

        let delivery_time = self.time + self.delay();
        self.order += 1;
        self.queue.push(DelayedPacket {
            delivery_time,
            order: self.order,
            client_index,
            data: data.to_vec(),
            _lease: lease,
        });
    }

    pub fn send_packet(&mut self, client_index: usize, data: &[u8]) {
        if self.roll(self.settings.loss_percent) {
            debug!("simulator dropped packet for client {}", client_index);
            return;
        }
        self.schedule(client_index, data);
        if self.roll(self.settings.duplicate_percent) {
            self.schedule(client_index, data);
        }
    }

    pub fn advance_time(&mut self, time: f64) {
        self.time = time;
    }

    /// Packets whose delivery time has come, earliest first.
    pub fn receive_packets(&mut self) -> Vec<(usize, Vec<u8>)> {
        let mut packets = Vec::new();
        while self
            .queue
            .peek()
            .is_some_and(|packet| packet.delivery_time <= self.time)
        {
            if let Some(packet) = self.queue.pop() {
                packets.push((packet.client_index, packet.data));
            }
        }
        packets
    }

    pub fn discard_client_packets(&mut self, client_index: usize) {
        self.queue.retain(|packet| packet.client_index != client_index);
    }

    pub fn discard_packets(&mut self) {
        self.queue.clear();
    }
}
