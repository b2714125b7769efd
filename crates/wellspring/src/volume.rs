//! Per-channel volume and latency range primitives

use std::time::Duration;

/// Maximum channels a source can carry
pub const MAX_CHANNELS: usize = 8;

/// Fixed-capacity per-channel linear gain set
///
/// Linear gains: 1.0 = unity, 0.0 = silence. Capacity is fixed so the value
/// is `Copy` and safe to move through the worker message ring without
/// allocating.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelVolumes {
    channels: u8,
    values: [f32; MAX_CHANNELS],
}

impl ChannelVolumes {
    /// Uniform gain across `channels` channels
    ///
    /// `channels` is clamped to `1..=MAX_CHANNELS`.
    pub fn uniform(channels: u8, gain: f32) -> Self {
        let channels = channels.clamp(1, MAX_CHANNELS as u8);
        Self {
            channels,
            values: [gain; MAX_CHANNELS],
        }
    }

    /// Number of channels
    pub fn len(&self) -> usize {
        self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.channels == 0
    }

    /// Gain for one channel (unity for out-of-range channels)
    pub fn get(&self, channel: usize) -> f32 {
        if channel < self.channels as usize {
            self.values[channel]
        } else {
            1.0
        }
    }

    /// Set the gain for one channel; out-of-range channels are ignored
    pub fn set(&mut self, channel: usize, gain: f32) {
        if channel < self.channels as usize {
            self.values[channel] = gain;
        }
    }

    /// Average gain across channels
    pub fn avg(&self) -> f32 {
        let n = self.channels as usize;
        self.values[..n].iter().sum::<f32>() / n as f32
    }
}

impl Default for ChannelVolumes {
    fn default() -> Self {
        Self::uniform(2, 1.0)
    }
}

/// Negotiated latency bounds for dynamic-latency sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyRange {
    /// The source won't go below this latency
    pub min: Duration,
    /// Upper limit for requested latencies
    pub max: Duration,
}

impl LatencyRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Clamp a requested latency into this range
    pub fn clamp(&self, latency: Duration) -> Duration {
        latency.clamp(self.min, self.max)
    }
}

impl Default for LatencyRange {
    fn default() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_volume() {
        let v = ChannelVolumes::uniform(2, 0.5);
        assert_eq!(v.len(), 2);
        assert!((v.get(0) - 0.5).abs() < 0.001);
        assert!((v.get(1) - 0.5).abs() < 0.001);
        // out of range reads as unity
        assert!((v.get(5) - 1.0).abs() < 0.001);
    }

    #[test]
    fn channel_count_clamped() {
        let v = ChannelVolumes::uniform(0, 1.0);
        assert_eq!(v.len(), 1);
        let v = ChannelVolumes::uniform(200, 1.0);
        assert_eq!(v.len(), MAX_CHANNELS);
    }

    #[test]
    fn avg_over_channels() {
        let mut v = ChannelVolumes::uniform(2, 1.0);
        v.set(1, 0.0);
        assert!((v.avg() - 0.5).abs() < 0.001);
    }

    #[test]
    fn latency_clamping() {
        let r = LatencyRange::new(Duration::from_millis(5), Duration::from_millis(100));
        assert_eq!(r.clamp(Duration::from_millis(1)), Duration::from_millis(5));
        assert_eq!(r.clamp(Duration::from_millis(50)), Duration::from_millis(50));
        assert_eq!(r.clamp(Duration::from_secs(3)), Duration::from_millis(100));
    }
}
