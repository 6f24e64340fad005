/// Folds sequential per-rendition progress into one job-level percentage.
///
/// While rendition `k` is at `p` percent, the job is at
/// `floor((completed * 100 + p) / total)`. Encode progress alone tops out at 99;
/// the caller reports 100 itself once the package is uploaded.
#[derive(Debug)]
pub struct ProgressAggregator {
    total: usize,
    completed: usize,
    last: u8,
}

impl ProgressAggregator {
    pub fn new(total: usize) -> Self {
        assert!(total > 0, "progress aggregation needs at least one rendition");
        Self {
            total,
            completed: 0,
            last: 0,
        }
    }

    /// Feeds the current rendition's progress. Returns the job percentage when it advanced.
    pub fn update(&mut self, rendition_percent: f64) -> Option<u8> {
        let p = if rendition_percent.is_finite() {
            rendition_percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let raw = ((self.completed as f64 * 100.0 + p) / self.total as f64).floor();
        self.advance(raw.min(99.0) as u8)
    }

    /// Marks the current rendition as finished.
    pub fn complete_rendition(&mut self) -> Option<u8> {
        self.completed = (self.completed + 1).min(self.total);
        let raw = (self.completed * 100) / self.total;
        self.advance(raw.min(99) as u8)
    }

    #[cfg(test)]
    pub fn completed(&self) -> usize {
        self.completed
    }

    #[cfg(test)]
    pub fn current(&self) -> u8 {
        self.last
    }

    fn advance(&mut self, value: u8) -> Option<u8> {
        if value > self.last {
            self.last = value;
            Some(value)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_renditions() {
        let mut agg = ProgressAggregator::new(3);
        assert_eq!(agg.update(50.0), Some(16));
        assert_eq!(agg.update(100.0), Some(33));
        assert_eq!(agg.complete_rendition(), None);
        assert_eq!(agg.update(0.0), None);
        assert_eq!(agg.update(60.0), Some(53));
        agg.complete_rendition();
        assert_eq!(agg.update(99.0), Some(99));
        assert_eq!(agg.complete_rendition(), None);
        assert_eq!(agg.current(), 99);
    }

    #[test]
    fn test_never_decreases_and_respects_bound() {
        for total in 1..=6usize {
            let mut agg = ProgressAggregator::new(total);
            let mut previous = 0u8;
            for k in 0..total {
                let bound = ((k * 100 + 100) / total) as u8;
                for step in 0..=20 {
                    agg.update(step as f64 * 5.0);
                    let current = agg.current();
                    assert!(current >= previous, "progress went backwards");
                    assert!(current <= bound, "{current} exceeds {bound} at rendition {k}");
                    previous = current;
                }
                agg.complete_rendition();
            }
            assert_eq!(agg.completed(), total);
            assert!(agg.current() < 100);
        }
    }

    #[test]
    fn test_encoder_regression_is_ignored() {
        let mut agg = ProgressAggregator::new(2);
        assert_eq!(agg.update(80.0), Some(40));
        assert_eq!(agg.update(20.0), None);
        assert_eq!(agg.update(f64::NAN), None);
        assert_eq!(agg.update(250.0), Some(50));
        assert_eq!(agg.current(), 50);
    }

    #[test]
    #[should_panic]
    fn test_empty_ladder_panics() {
        ProgressAggregator::new(0);
    }
}
