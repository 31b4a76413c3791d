/// Rolling RTT statistics over a bounded sample buffer. When the buffer
/// fills, it is cleared and the next sample starts a fresh window, so the
/// derived values always cover the current contents.
#[derive(Debug, Default)]
pub(crate) struct RttStats {
    samples: Vec<u64>,
    capacity: usize,
    sum: u128,
    sum_of_squares: u128,
    pub(crate) last: u64,
    pub(crate) min: u64,
    pub(crate) max: u64,
    pub(crate) mean: u64,
    pub(crate) std_dev: u64,
}

impl RttStats {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            ..Default::default()
        }
    }

    pub(crate) fn update(&mut self, rtt_nanos: u64) {
        if self.samples.len() == self.capacity {
            self.samples.clear();
            self.sum = 0;
            self.sum_of_squares = 0;
        }

        self.samples.push(rtt_nanos);
        self.sum += u128::from(rtt_nanos);
        self.sum_of_squares += u128::from(rtt_nanos) * u128::from(rtt_nanos);

        let count = self.samples.len() as u128;
        self.last = rtt_nanos;
        if self.samples.len() == 1 {
            self.min = rtt_nanos;
            self.max = rtt_nanos;
        } else {
            self.min = self.min.min(rtt_nanos);
            self.max = self.max.max(rtt_nanos);
        }
        self.mean = (self.sum / count) as u64;

        let mean_of_squares = self.sum_of_squares as f64 / count as f64;
        let mean = self.mean as f64;
        self.std_dev = (mean_of_squares - mean * mean).max(0.0).sqrt() as u64;
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }
}
