//! Bounded per-class demand history.

use std::collections::VecDeque;

use super::PrewarmError;
use crate::clock::UnixMillis;
use crate::ResourceClass;

/// FIFO of request timestamps for one resource class.
///
/// Holds at most `capacity` timestamps; the oldest is evicted on overflow.
/// Stores timestamps only, never request content.
#[derive(Debug, Clone)]
pub struct ResourceDemandSeries {
    class: ResourceClass,
    capacity: usize,
    timestamps: VecDeque<UnixMillis>,
}

impl ResourceDemandSeries {
    /// Empty series. A `capacity` of zero is treated as one.
    pub fn new(class: ResourceClass, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            class,
            capacity,
            timestamps: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Resource class this series tracks.
    pub fn class(&self) -> &ResourceClass {
        &self.class
    }

    /// Append a timestamp, evicting the oldest beyond capacity. O(1).
    pub fn observe(&mut self, ts: UnixMillis) {
        if self.timestamps.len() >= self.capacity {
            self.timestamps.pop_front();
        }
        self.timestamps.push_back(ts);
    }

    /// Stored timestamp count.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Return `true` if nothing has been observed.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Latest observed timestamp.
    pub fn last(&self) -> Option<UnixMillis> {
        self.timestamps.iter().copied().max()
    }

    /// Median gap between consecutive timestamps, in milliseconds.
    ///
    /// Timestamps are ordered first, so late-arriving observations do not
    /// produce negative gaps. For an even number of gaps the mean of the
    /// two middle gaps is returned. `None` below two timestamps.
    pub fn median_interval(&self) -> Option<f64> {
        if self.timestamps.len() < 2 {
            return None;
        }
        let mut sorted: Vec<UnixMillis> = self.timestamps.iter().copied().collect();
        sorted.sort_unstable();
        let mut gaps: Vec<u64> = sorted.windows(2).map(|w| w[1] - w[0]).collect();
        gaps.sort_unstable();
        let mid = gaps.len() / 2;
        Some(if gaps.len() % 2 == 0 {
            (gaps[mid - 1] as f64 + gaps[mid] as f64) / 2.0
        } else {
            gaps[mid] as f64
        })
    }

    /// Next expected demand: last timestamp plus the median interval, rounded
    /// to the nearest millisecond.
    ///
    /// # Errors
    ///
    /// Returns [`PrewarmError::InsufficientHistory`] with fewer than
    /// `min_observations` timestamps (or fewer than two).
    pub fn forecast(&self, min_observations: usize) -> Result<UnixMillis, PrewarmError> {
        let needed = min_observations.max(2);
        let insufficient = || PrewarmError::InsufficientHistory {
            class: self.class.to_string(),
            needed,
            have: self.timestamps.len(),
        };
        if self.timestamps.len() < needed {
            return Err(insufficient());
        }
        let (Some(last), Some(median)) = (self.last(), self.median_interval()) else {
            return Err(insufficient());
        };
        Ok(last.saturating_add(median.round() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::secs;

    fn series(ts: &[u64]) -> ResourceDemandSeries {
        let mut s = ResourceDemandSeries::new(ResourceClass::new("slm_balanced"), 1000);
        for t in ts {
            s.observe(secs(*t));
        }
        s
    }

    #[test]
    fn test_observe_evicts_oldest_beyond_capacity() {
        let mut s = ResourceDemandSeries::new(ResourceClass::new("c"), 3);
        for t in 0..5 {
            s.observe(t);
        }
        assert_eq!(s.len(), 3);
        assert_eq!(s.timestamps.front(), Some(&2));
    }

    #[test]
    fn test_median_interval_even_gap_count() {
        // Gaps 60, 62, 59, 58 → sorted 58, 59, 60, 62 → median 59.5 s.
        let s = series(&[0, 60, 122, 181, 239]);
        assert_eq!(s.median_interval(), Some(59_500.0));
    }

    #[test]
    fn test_median_interval_odd_gap_count() {
        let s = series(&[0, 10, 30, 60]);
        assert_eq!(s.median_interval(), Some(20_000.0));
    }

    #[test]
    fn test_forecast_is_last_plus_median() {
        let s = series(&[0, 60, 122, 181, 239]);
        assert_eq!(s.forecast(5).unwrap(), 298_500);
    }

    #[test]
    fn test_forecast_requires_min_observations() {
        let s = series(&[0, 60, 122, 181, 239]);
        assert!(matches!(
            s.forecast(10),
            Err(PrewarmError::InsufficientHistory { needed: 10, have: 5, .. })
        ));
    }

    #[test]
    fn test_out_of_order_observations_are_ordered() {
        let s = series(&[60, 0, 120]);
        assert_eq!(s.median_interval(), Some(60_000.0));
        assert_eq!(s.last(), Some(120_000));
    }
}
