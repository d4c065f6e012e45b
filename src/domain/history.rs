// Bounded per-sensor sample history
use serde::Serialize;
use std::collections::VecDeque;

pub const HISTORY_CAPACITY: usize = 48;

/// Fixed-capacity FIFO of recent samples; the oldest sample is evicted first.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    capacity: usize,
    samples: VecDeque<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub peak: f64,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }

    /// Min is floored at zero so gauges always include the origin.
    pub fn stats(&self) -> HistoryStats {
        if self.samples.is_empty() {
            return HistoryStats::default();
        }
        let peak = self.samples.iter().copied().fold(f64::MIN, f64::max);
        let min = self.samples.iter().copied().fold(0.0, f64::min);
        let avg = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        HistoryStats {
            min: round2(min),
            max: round2(peak),
            avg: round2(avg),
            peak: round2(peak),
        }
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_exceeds_capacity() {
        let mut buffer = HistoryBuffer::new(HISTORY_CAPACITY);
        for i in 0..200 {
            buffer.push(i as f64);
            assert!(buffer.len() <= HISTORY_CAPACITY);
        }
        assert_eq!(buffer.len(), HISTORY_CAPACITY);
        assert_eq!(buffer.latest(), Some(199.0));
        assert_eq!(buffer.to_vec().first(), Some(&152.0));
        assert!(!buffer.to_vec().contains(&0.0));
    }

    #[test]
    fn test_stats() {
        let mut buffer = HistoryBuffer::new(4);
        assert_eq!(buffer.stats(), HistoryStats::default());
        for v in [2.0, 4.0, 6.0] {
            buffer.push(v);
        }
        let stats = buffer.stats();
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.max, 6.0);
        assert_eq!(stats.avg, 4.0);
        assert_eq!(stats.peak, 6.0);

        buffer.push(-1.5);
        assert_eq!(buffer.stats().min, -1.5);
        assert_eq!(buffer.stats().avg, 2.63);
    }
}
