//! Per-channel sample cache.
//!
//! Every published channel keeps the most recent samples in a flat cache so
//! a newly created pipeline can seed its filters with realistic history.
//! On overflow the newest half-cache worth of samples is retained (less the
//! incoming run); if the incoming run alone exceeds that, the cache resets
//! before the append. The tail of the cache always equals the tail of the
//! concatenated input.

/// 30 seconds of history at the full 40 kS/s rate.
pub const CACHE_SIZE: usize = 40_000 * 30;

pub struct DataBuffer {
    cache: Vec<f32>,
    cache_end: usize,
    capacity: usize,
    /// Samples appended by the current tick, if any.
    result: Option<Vec<f32>>,
}

impl DataBuffer {
    pub fn new() -> Self {
        Self::with_capacity(CACHE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: vec![0.0; capacity],
            cache_end: 0,
            capacity,
            result: None,
        }
    }

    /// Append one tick's samples, evicting old history on overflow.
    pub fn add_data(&mut self, data: &[f32]) {
        if data.is_empty() {
            self.result = None;
            return;
        }

        self.result = Some(data.to_vec());
        let data_len = data.len();

        if data_len + self.cache_end >= self.capacity {
            let num_to_keep = (self.capacity / 2)
                .saturating_sub(data_len)
                .min(self.cache_end);

            if num_to_keep > 0 {
                self.cache
                    .copy_within(self.cache_end - num_to_keep..self.cache_end, 0);
                self.cache_end = num_to_keep;
            } else {
                self.cache_end = 0;
            }

            let num_to_add = data_len.min(self.capacity);
            self.cache[self.cache_end..self.cache_end + num_to_add]
                .copy_from_slice(&data[data_len - num_to_add..]);
            self.cache_end += num_to_add;
        } else {
            self.cache[self.cache_end..self.cache_end + data_len].copy_from_slice(data);
            self.cache_end += data_len;
        }
    }

    /// All cached samples, oldest first.
    pub fn cache(&self) -> &[f32] {
        &self.cache[..self.cache_end]
    }

    pub fn cache_end(&self) -> usize {
        self.cache_end
    }

    /// The current tick's increment.
    pub fn result(&self) -> Option<&[f32]> {
        self.result.as_deref()
    }

    pub fn reset_result(&mut self) {
        self.result = None;
    }

    pub fn clear(&mut self) {
        self.cache_end = 0;
        self.result = None;
    }
}

impl Default for DataBuffer {
    fn default() -> Self {
        Self::new()
    }
}
