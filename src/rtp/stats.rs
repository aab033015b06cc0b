//! Stream byte/packet counters with windowed rate readout

/// Running counters for one direction of one stream
#[derive(Debug, Default)]
pub struct StreamStats {
    bytes: u64,
    packets: u64,
    window_start_ms: i64,
    window_bytes: u64,
    window_packets: u64,
}

/// Average rate over the last readout window
#[derive(Debug, Clone, Copy)]
pub struct StreamRate {
    pub bytes_per_sec: u64,
    pub packets_per_sec: u64,
}

impl StreamRate {
    #[must_use]
    pub const fn kbits_per_sec(&self) -> u64 {
        self.bytes_per_sec * 8 / 1000
    }
}

impl StreamStats {
    pub fn record(&mut self, len: usize, now_ms: i64) {
        if self.window_start_ms == 0 {
            self.window_start_ms = now_ms;
        }
        self.bytes += len as u64;
        self.packets += 1;
        self.window_bytes += len as u64;
        self.window_packets += 1;
    }

    /// Average rate since the previous readout; resets the window.
    pub fn rate(&mut self, now_ms: i64) -> StreamRate {
        let elapsed_ms = (now_ms - self.window_start_ms).max(1) as u64;
        let rate = StreamRate {
            bytes_per_sec: self.window_bytes * 1000 / elapsed_ms,
            packets_per_sec: self.window_packets * 1000 / elapsed_ms,
        };
        self.window_start_ms = now_ms;
        self.window_bytes = 0;
        self.window_packets = 0;
        rate
    }

    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub const fn packets(&self) -> u64 {
        self.packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_resets_window() {
        let mut stats = StreamStats::default();
        stats.record(1000, 1_000);
        stats.record(1000, 1_500);
        let rate = stats.rate(2_000);
        assert_eq!(rate.bytes_per_sec, 2000);
        assert_eq!(rate.packets_per_sec, 2);
        assert_eq!(stats.bytes(), 2000);
        assert_eq!(stats.packets(), 2);

        let idle = stats.rate(3_000);
        assert_eq!(idle.bytes_per_sec, 0);
    }
}
