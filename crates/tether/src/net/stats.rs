#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_acked: u64,
    pub packets_stale: u64,
    pub packets_duplicate: u64,
    pub packets_invalid: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
    pub packet_loss_percent: f32,
}

/// Jacobson/Karels smoothed round trip estimate.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    srtt: f32,
    rtt_var: f32,
    sampled: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt: 0.0,
            rtt_var: 0.0,
            sampled: false,
        }
    }
}

impl RttEstimator {
    pub fn update(&mut self, rtt_ms: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        if !self.sampled {
            self.srtt = rtt_ms;
            self.rtt_var = rtt_ms / 2.0;
            self.sampled = true;
            return;
        }

        let diff = (rtt_ms - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt_ms;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }
}
