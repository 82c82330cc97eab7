//! Tempo estimation from incoming MIDI beat-clock ticks

/// Lowest BPM the estimator will report
pub const MIN_BPM: f64 = 24.0;
/// Highest BPM the estimator will report
pub const MAX_BPM: f64 = 360.0;

/// Beat-clock ticks per quarter note
const TICKS_PER_QUARTER: f64 = 24.0;
/// Relative interval change treated as loss of clock lock
const DRIFT_TOLERANCE: f64 = 0.05;

/// Statistical BPM estimator over a 24-ppqn clock stream
///
/// Instantaneous per-tick tempo is too jittery to display, so ticks are
/// averaged over a window whose size grows with the tempo (faster tempos
/// need more samples for the same relative precision), and a value is only
/// emitted after two consecutive windows agree. An interval jumping more
/// than 5% away from the previous one resets the estimator; nothing is
/// emitted again until the stream re-stabilizes.
#[derive(Debug, Default)]
pub struct BeatClockEstimator {
    last_tick: Option<f64>,
    last_interval: Option<f64>,
    sum: f64,
    count: u32,
    candidate: Option<u16>,
    last_emitted: Option<u16>,
}

impl BeatClockEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one clock tick (timestamp in seconds); returns a newly
    /// stabilized BPM when one is confirmed
    pub fn observe(&mut self, tick_secs: f64) -> Option<u16> {
        let prev_tick = match self.last_tick.replace(tick_secs) {
            Some(t) => t,
            None => return None,
        };
        let interval = tick_secs - prev_tick;
        if interval <= 0.0 {
            self.relock(None);
            return None;
        }

        if let Some(last) = self.last_interval {
            if (interval - last).abs() > last * DRIFT_TOLERANCE {
                self.relock(Some(interval));
                return None;
            }
        }
        self.last_interval = Some(interval);

        let instant = 60.0 / (TICKS_PER_QUARTER * interval);
        self.sum += instant;
        self.count += 1;

        // Window length scales quadratically with tempo
        let needed = (instant * instant * 0.0002 + 1.0) as u32;
        if self.count < needed {
            return None;
        }

        let mean = self.sum / self.count as f64;
        self.sum = 0.0;
        self.count = 0;
        let bpm = mean.clamp(MIN_BPM, MAX_BPM).round() as u16;

        // Accumulate-then-confirm: a single window can report a transient
        // bogus tempo, so require the next window to agree before emitting
        if self.candidate == Some(bpm) {
            if self.last_emitted != Some(bpm) {
                self.last_emitted = Some(bpm);
                return Some(bpm);
            }
        } else {
            self.candidate = Some(bpm);
        }
        None
    }

    /// The last value handed out, if any
    pub fn current(&self) -> Option<u16> {
        self.last_emitted
    }

    fn relock(&mut self, interval: Option<f64>) {
        self.last_interval = interval;
        self.sum = 0.0;
        self.count = 0;
        self.candidate = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `n` ticks at a fixed interval starting at `t0`; collect emissions
    fn run_ticks(est: &mut BeatClockEstimator, t0: f64, interval: f64, n: usize) -> (Vec<u16>, f64) {
        let mut out = Vec::new();
        let mut t = t0;
        for _ in 0..n {
            if let Some(bpm) = est.observe(t) {
                out.push(bpm);
            }
            t += interval;
        }
        (out, t)
    }

    #[test]
    fn test_converges_on_steady_stream() {
        let mut est = BeatClockEstimator::new();
        // 120 BPM: interval = 60 / (24 * 120)
        let interval = 60.0 / (24.0 * 120.0);
        let (out, _) = run_ticks(&mut est, 0.0, interval, 30);
        assert_eq!(out, vec![120]);
        assert_eq!(est.current(), Some(120));
    }

    #[test]
    fn test_drift_resets_and_relocks() {
        let mut est = BeatClockEstimator::new();
        let fast = 60.0 / (24.0 * 120.0);
        let (out, t_end) = run_ticks(&mut est, 0.0, fast, 30);
        assert_eq!(out, vec![120]);

        // Interval jumps 20%: lock is lost, and nothing may be emitted for
        // at least a full window afterwards
        let slow = fast * 1.2;
        let bpm_slow = (60.0 / (24.0 * slow)).round() as u16;
        let (out, _) = run_ticks(&mut est, t_end, slow, 40);
        assert_eq!(out, vec![bpm_slow]);
    }

    #[test]
    fn test_no_emission_before_confirmation_window() {
        let mut est = BeatClockEstimator::new();
        let interval = 60.0 / (24.0 * 120.0);
        // First tick sets the reference; the next few build the first
        // window. Two windows of 3 ticks each are needed at 120 BPM, so
        // nothing can appear within the first 6 observations.
        let (out, _) = run_ticks(&mut est, 0.0, interval, 6);
        assert!(out.is_empty());
    }

    #[test]
    fn test_clamped_to_supported_range() {
        let mut est = BeatClockEstimator::new();
        // Absurdly slow clock: 4 BPM instantaneous
        let interval = 60.0 / (24.0 * 4.0);
        let (out, _) = run_ticks(&mut est, 0.0, interval, 10);
        assert_eq!(out, vec![24]);
    }
}
