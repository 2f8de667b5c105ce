//! Average framerate estimation from observed frame durations.
//!
//! The estimator pulls frames through a [`FrameSupply`] in rounds, builds a
//! histogram of the fixed frames' durations and derives a rational average
//! framerate from it. Containers with coarse timebases produce jittery
//! durations (3753/3754 ticks for 23.976 fps at 1/90000), so the raw average
//! is reconciled with the decoder-reported rate and snapped to `n*1000/1001`
//! or `n/1` when it is close enough.

use reelsync_common::Rational;
use tracing::{debug, warn};

#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

use crate::ledger::{FrameRecord, Ledger, PtsStatus};

/// Maximum number of analysis rounds.
pub const MAX_ROUNDS: usize = 5;

/// Frame cap when an analyze duration is configured.
const ANALYZE_FRAME_CAP: usize = 7200;

/// Rates above this are treated as misdetections.
const MAX_PLAUSIBLE_FPS: f64 = 2000.0;

/// Used when no candidate rate is usable at all.
pub const FALLBACK_FRAMERATE: Rational = Rational::new(30, 1);

/// Source of video frames for the estimator.
///
/// Implemented by the demux reader: each call reads packets until one more
/// video frame has been appended to the ledger.
pub trait FrameSupply {
    /// Error raised by the underlying reader.
    type Error;

    /// Read one more video frame. Returns `false` at end of input, after the
    /// ledger has been finalized.
    fn read_frame(&mut self) -> Result<bool, Self::Error>;

    /// The ledger being filled.
    fn ledger(&self) -> &Ledger;

    /// Mutable access for fixing.
    fn ledger_mut(&mut self) -> &mut Ledger;

    /// Number of non-keyframe video packets skipped before the first keyframe.
    fn keyframe_offset(&self) -> usize;
}

/// Stream parameters the estimator needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimatorInput {
    /// Packet timebase of the video stream.
    pub timebase: Rational,
    /// Framerate reported by the decoder (may be invalid).
    pub decoder_rate: Rational,
    /// Framerate reported by the codec parameters (may be invalid).
    pub codec_rate: Rational,
    /// Codec ticks per frame (2 for field-based H.264 timing).
    pub ticks_per_frame: i64,
    /// Optional analysis window in seconds.
    pub analyze_secs: Option<u32>,
}

impl EstimatorInput {
    /// Expected duration of one frame in timebase ticks, `1` when unknown.
    pub fn expected_frame_duration(&self) -> i64 {
        let rate = if self.decoder_rate.is_valid() {
            self.decoder_rate
        } else {
            self.codec_rate
        };
        if !rate.is_valid() || !self.timebase.is_valid() {
            return 1;
        }
        Rational::rescale(1, rate.invert(), self.timebase).max(1)
    }

    fn initial_caps(&self) -> (usize, f64) {
        match self.analyze_secs {
            Some(secs) => (ANALYZE_FRAME_CAP, f64::from(secs)),
            None => {
                let den = self.timebase.den;
                let frames = if den >= 1000 && den % 60 != 0 { 128 } else { 48 };
                (frames, f64::INFINITY)
            }
        }
    }
}

/// One histogram bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct DurationBucket {
    /// Frame duration in timebase ticks.
    pub duration: i64,
    /// Number of frames with that duration.
    pub count: usize,
}

/// Histogram of fixed-frame durations, most frequent first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct DurationHistogram {
    buckets: Vec<DurationBucket>,
    durations: Vec<i64>,
}

impl DurationHistogram {
    /// Build from frames; records without a poc (second fields) are skipped.
    pub fn from_frames<'a>(frames: impl IntoIterator<Item = &'a FrameRecord>) -> Self {
        let mut hist = Self::default();
        for rec in frames.into_iter().filter(|r| r.poc.is_some()) {
            let mut duration = rec.total_duration();
            if rec.repeat > 1 {
                duration = (duration as f64 * 2.0 / f64::from(rec.repeat + 1) + 0.5) as i64;
            }
            hist.durations.push(duration);
            match hist.buckets.iter_mut().find(|b| b.duration == duration) {
                Some(bucket) => bucket.count += 1,
                None => hist.buckets.push(DurationBucket { duration, count: 1 }),
            }
        }
        hist.buckets.sort_by(|a, b| b.count.cmp(&a.count));
        hist
    }

    /// Buckets, most frequent first.
    pub fn buckets(&self) -> &[DurationBucket] {
        &self.buckets
    }

    /// Number of sampled frames.
    pub fn samples(&self) -> usize {
        self.durations.len()
    }

    /// Mean duration, `0.0` without samples.
    pub fn mean(&self) -> f64 {
        if self.durations.is_empty() {
            return 0.0;
        }
        let sum: i128 = self.durations.iter().map(|&d| d as i128).sum();
        sum as f64 / self.durations.len() as f64
    }

    /// Most frequent non-zero duration, unless zero is the only one seen.
    pub fn most_popular(&self) -> Option<DurationBucket> {
        let skip_zero = self.buckets.len() > 1 && self.buckets[0].duration == 0;
        self.buckets.get(usize::from(skip_zero)).copied()
    }

    /// Whether round `round` has seen enough to stop analysing.
    pub fn is_conclusive(&self, round: usize) -> bool {
        if self.buckets.len() <= 1 {
            return true;
        }
        if round == 0 {
            return false;
        }
        let top = self.buckets[0];
        let share = top.count as f64 / self.samples() as f64;
        share > 0.95 || (top.duration - self.buckets[1].duration).abs() <= 1
    }
}

/// Result of framerate estimation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct Estimate {
    /// Reduced and snapped average framerate.
    pub avg_framerate: Rational,
    /// No usable timestamps: pts are synthesized from the framerate.
    pub pts_all_invalid: bool,
    /// Non-keyframe packets skipped before the first keyframe.
    pub keyframe_offset: usize,
    /// Histogram of the last round.
    pub histogram: DurationHistogram,
    /// Analysis rounds performed.
    pub rounds: usize,
}

/// Multi-round framerate estimator.
#[derive(Debug, Clone)]
pub struct FramerateEstimator {
    input: EstimatorInput,
}

impl FramerateEstimator {
    /// Create an estimator for a stream.
    pub fn new(input: EstimatorInput) -> Self {
        Self { input }
    }

    /// Read frames from `supply` and estimate the average framerate.
    pub fn run<S: FrameSupply>(&self, supply: &mut S) -> Result<Estimate, S::Error> {
        let (mut max_frames, mut max_secs) = self.input.initial_caps();
        let expected = self.input.expected_frame_duration();
        let mut histogram = DurationHistogram::default();
        let mut exhausted = false;
        let mut rounds = 0;

        for round in 0..MAX_ROUNDS {
            rounds = round + 1;
            while !exhausted
                && supply.ledger().len() < max_frames
                && self.elapsed_secs(supply.ledger()) < max_secs
            {
                if !supply.read_frame()? {
                    exhausted = true;
                }
            }
            supply.ledger_mut().fix(expected);
            histogram = DurationHistogram::from_frames(supply.ledger().fixed_frames());

            debug!(
                round,
                timebase = %self.input.timebase,
                decoder_rate = %self.input.decoder_rate,
                frames = histogram.samples(),
                "duration histogram"
            );
            for bucket in histogram.buckets() {
                debug!("{:>8} [{:>5} frames]", bucket.duration, bucket.count);
            }

            if exhausted || histogram.is_conclusive(round) {
                break;
            }
            max_frames = max_frames.saturating_mul(2);
            max_secs *= 2.0;
        }

        let synthesized = supply.ledger().pts_status() == PtsStatus::AllInvalid;
        let (avg_framerate, pts_all_invalid) = self.derive_rate(&histogram, synthesized);
        debug!(%avg_framerate, pts_all_invalid, "final average framerate");

        Ok(Estimate {
            avg_framerate,
            pts_all_invalid,
            keyframe_offset: supply.keyframe_offset(),
            histogram,
            rounds,
        })
    }

    /// Derive the average framerate from a histogram.
    ///
    /// `synthesized` is set when the ledger had to invent timestamps. Returns
    /// the rate and whether timestamps must be treated as all invalid.
    pub fn derive_rate(&self, histogram: &DurationHistogram, synthesized: bool) -> (Rational, bool) {
        let tb = self.input.timebase;
        let decoder = self.input.decoder_rate;

        let estimated = match histogram.most_popular() {
            Some(popular) if popular.duration != 0 && tb.is_valid() => {
                Some(estimate_from_durations(histogram, popular, tb))
            }
            _ => None,
        };
        let pts_all_invalid = synthesized || estimated.is_none();

        let mut rate = match estimated {
            _ if pts_all_invalid && decoder.is_valid() => decoder,
            None => Rational::new(0, 0),
            Some(est) if pts_all_invalid => est,
            Some(est) => reconcile(est, decoder, histogram.samples()),
        };

        if !rate.is_valid() || rate.as_f64() > MAX_PLAUSIBLE_FPS || rate.as_f64() < 0.0 {
            rate = self.fallback_rate();
        }

        (snap(rate.reduce()), pts_all_invalid)
    }

    fn fallback_rate(&self) -> Rational {
        let positive = |r: Rational| r.num > 0 && r.den > 0;
        let tb = self.input.timebase;
        if positive(self.input.decoder_rate) {
            self.input.decoder_rate
        } else if positive(self.input.codec_rate) {
            self.input.codec_rate
        } else if positive(tb) {
            Rational::new(tb.den * self.input.ticks_per_frame.max(1), tb.num)
        } else {
            warn!("no usable framerate, assuming {}", FALLBACK_FRAMERATE);
            FALLBACK_FRAMERATE
        }
    }

    fn elapsed_secs(&self, ledger: &Ledger) -> f64 {
        let stamp = |r: &FrameRecord| r.dts.or(r.pts);
        let (Some(first), Some(last)) = (
            ledger.demuxed(0).and_then(stamp),
            ledger.len().checked_sub(1).and_then(|i| ledger.demuxed(i)).and_then(stamp),
        ) else {
            return 0.0;
        };
        (last - first) as f64 * self.input.timebase.as_f64()
    }
}

fn estimate_from_durations(
    histogram: &DurationHistogram,
    popular: DurationBucket,
    tb: Rational,
) -> Rational {
    let samples = histogram.samples() as f64;
    let mut avg_duration = histogram.mean();
    let avg_fps = tb.den as f64 / (avg_duration * tb.num as f64);
    let near = |target: f64| (1.0 - avg_fps / target).abs() < 0.5;
    let tolerance = if near(25.0) || near(50.0) { 0.05 } else { 0.0008 };
    if popular.count as f64 / samples > 0.95
        && (1.0 - popular.duration as f64 / avg_duration).abs() < tolerance
    {
        debug!(duration = popular.duration, "using most popular duration");
        avg_duration = popular.duration as f64;
    }

    let mul = (1001.0 / tb.num as f64).ceil() as i64;
    let den = tb.num * mul;
    let num = (tb.den as f64 * mul as f64 / avg_duration + 0.5) as i64;
    debug!(mul, avg_duration, "estimated {}/{}", num, den);
    Rational::new(num, den)
}

/// Prefer the decoder rate when the estimate is within measurement error of it.
fn reconcile(estimated: Rational, decoder: Rational, samples: usize) -> Rational {
    if !decoder.is_valid() {
        return estimated;
    }
    let dec = decoder.as_f64();
    let est = estimated.as_f64();
    if (dec / est - 1.0).abs() < 2.0 / samples.max(1) as f64 {
        debug!("using decoder framerate");
        return decoder;
    }
    let nudge = if dec < est { 1 } else { -1 };
    let nudged = estimated.num as f64 / (estimated.den + nudge) as f64;
    if (est - dec).abs() < (nudged - dec).abs() {
        decoder
    } else {
        estimated
    }
}

/// Snap to `n*1000/1001` or `n/1` when within 1e-4.
fn snap(rate: Rational) -> Rational {
    let fps = rate.as_f64();
    let rounded = (fps + 0.5) as i64 * 1000;
    if rounded <= 0 {
        return rate;
    }
    if (fps * 1001.0 / rounded as f64 - 1.0).abs() < 1e-4 {
        return Rational::new(rounded, 1001);
    }
    if (fps * 1000.0 / rounded as f64 - 1.0).abs() < 1e-4 {
        return Rational::new(rounded / 1000, 1);
    }
    rate
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSupply {
        frames: Vec<FrameRecord>,
        next: usize,
        ledger: Ledger,
        expected: i64,
    }

    impl VecSupply {
        fn new(frames: Vec<FrameRecord>, expected: i64) -> Self {
            Self {
                frames,
                next: 0,
                ledger: Ledger::new(),
                expected,
            }
        }
    }

    impl FrameSupply for VecSupply {
        type Error = std::convert::Infallible;

        fn read_frame(&mut self) -> Result<bool, Self::Error> {
            match self.frames.get(self.next) {
                Some(rec) => {
                    self.ledger.append(*rec);
                    self.ledger.fix(self.expected);
                    self.next += 1;
                    Ok(true)
                }
                None => {
                    let end = self.ledger.max_end_pts().unwrap_or(0);
                    self.ledger.finalize(end, None);
                    Ok(false)
                }
            }
        }

        fn ledger(&self) -> &Ledger {
            &self.ledger
        }

        fn ledger_mut(&mut self) -> &mut Ledger {
            &mut self.ledger
        }

        fn keyframe_offset(&self) -> usize {
            0
        }
    }

    fn input(tb: Rational, decoder: Rational) -> EstimatorInput {
        EstimatorInput {
            timebase: tb,
            decoder_rate: decoder,
            codec_rate: Rational::new(0, 1),
            ticks_per_frame: 1,
            analyze_secs: None,
        }
    }

    fn constant(count: usize, duration: i64) -> Vec<FrameRecord> {
        (0..count as i64)
            .map(|i| FrameRecord::new(Some(i * duration), Some(i * duration), duration, i == 0))
            .collect()
    }

    fn jittered(count: usize) -> Vec<FrameRecord> {
        let mut pts = 0;
        (0..count)
            .map(|i| {
                let duration = if i % 2 == 0 { 3753 } else { 3754 };
                let rec = FrameRecord::new(Some(pts), Some(pts), duration, i == 0);
                pts += duration;
                rec
            })
            .collect()
    }

    #[test]
    fn test_constant_duration_converges() {
        let mut supply = VecSupply::new(constant(500, 3600), 3600);
        let est = FramerateEstimator::new(input(Rational::new(1, 90_000), Rational::new(0, 1)))
            .run(&mut supply)
            .unwrap();
        assert_eq!(est.avg_framerate, Rational::new(25, 1));
        assert!(!est.pts_all_invalid);
        assert_eq!(est.rounds, 1);
    }

    #[test]
    fn test_ntsc_film_from_jittered_durations() {
        let mut supply = VecSupply::new(jittered(2000), 3754);
        let est = FramerateEstimator::new(input(Rational::new(1, 90_000), Rational::new(0, 0)))
            .run(&mut supply)
            .unwrap();
        assert_eq!(est.avg_framerate, Rational::new(24000, 1001));
        assert_eq!(est.histogram.buckets().len(), 2);
    }

    #[test]
    fn test_ntsc_film_from_short_input() {
        let mut supply = VecSupply::new(jittered(24), 3754);
        let est = FramerateEstimator::new(input(Rational::new(1, 90_000), Rational::new(0, 0)))
            .run(&mut supply)
            .unwrap();
        assert_eq!(supply.ledger.len(), 24);
        assert_eq!(est.avg_framerate, Rational::new(24000, 1001));
    }

    #[test]
    fn test_ntsc_film_prefers_decoder_rate() {
        let mut supply = VecSupply::new(jittered(2000), 3754);
        let est = FramerateEstimator::new(input(
            Rational::new(1, 90_000),
            Rational::new(24000, 1001),
        ))
        .run(&mut supply)
        .unwrap();
        assert_eq!(est.avg_framerate, Rational::new(24000, 1001));
    }

    #[test]
    fn test_round_caps_double() {
        let mut supply = VecSupply::new(jittered(5000), 3754);
        let est = FramerateEstimator::new(input(Rational::new(1, 90_000), Rational::new(0, 0)))
            .run(&mut supply)
            .unwrap();
        // 48 -> 96: two buckets one tick apart stop the second round.
        assert_eq!(est.rounds, 2);
        assert_eq!(supply.ledger.len(), 96);
    }

    #[test]
    fn test_all_invalid_uses_decoder_rate() {
        let frames: Vec<FrameRecord> = (0..60)
            .map(|_| FrameRecord::new(None, None, 0, false))
            .collect();
        let params = input(Rational::new(1, 1000), Rational::new(30000, 1001));
        let mut supply = VecSupply::new(frames, params.expected_frame_duration());
        let est = FramerateEstimator::new(params).run(&mut supply).unwrap();
        assert!(est.pts_all_invalid);
        assert_eq!(est.avg_framerate, Rational::new(30000, 1001));
    }

    #[test]
    fn test_empty_histogram_is_all_invalid() {
        let est = FramerateEstimator::new(input(Rational::new(1, 90_000), Rational::new(0, 0)));
        let (rate, all_invalid) = est.derive_rate(&DurationHistogram::default(), false);
        assert!(all_invalid);
        assert_eq!(rate, Rational::new(90_000, 1));
    }

    #[test]
    fn test_implausible_rate_falls_back() {
        // 1 tick per frame at 1/90000 would be 90000 fps.
        let mut ledger = Ledger::new();
        for rec in constant(10, 1) {
            ledger.append(rec);
        }
        ledger.finalize(10, None);
        let hist = DurationHistogram::from_frames(ledger.fixed_frames());
        let mut params = input(Rational::new(1, 90_000), Rational::new(0, 0));
        params.codec_rate = Rational::new(50, 1);
        let (rate, all_invalid) = FramerateEstimator::new(params).derive_rate(&hist, false);
        assert!(!all_invalid);
        assert_eq!(rate, Rational::new(50, 1));
    }

    #[test]
    fn test_histogram_skips_unresolved_and_corrects_repeat() {
        let mut a = FrameRecord::new(Some(0), None, 3003, true);
        a.poc = Some(0);
        let mut b = FrameRecord::new(Some(3003), None, 3003, false);
        b.poc = Some(1);
        b.repeat = 2;
        let c = FrameRecord::new(Some(6006), None, 3003, false);
        let hist = DurationHistogram::from_frames([a, b, c].iter());
        assert_eq!(hist.samples(), 2);
        // 3003 * 2 / 3 = 2002
        assert!(hist.buckets().iter().any(|bk| bk.duration == 2002));
    }

    #[test]
    fn test_is_conclusive() {
        let single = DurationHistogram {
            buckets: vec![DurationBucket { duration: 10, count: 5 }],
            durations: vec![10; 5],
        };
        assert!(single.is_conclusive(0));

        let jitter = DurationHistogram {
            buckets: vec![
                DurationBucket { duration: 10, count: 3 },
                DurationBucket { duration: 11, count: 2 },
            ],
            durations: vec![10, 10, 10, 11, 11],
        };
        assert!(!jitter.is_conclusive(0));
        assert!(jitter.is_conclusive(1));

        let spread = DurationHistogram {
            buckets: vec![
                DurationBucket { duration: 10, count: 3 },
                DurationBucket { duration: 20, count: 2 },
            ],
            durations: vec![10, 10, 10, 20, 20],
        };
        assert!(!spread.is_conclusive(3));
    }

    #[test]
    fn test_most_popular_skips_zero() {
        let hist = DurationHistogram {
            buckets: vec![
                DurationBucket { duration: 0, count: 9 },
                DurationBucket { duration: 40, count: 1 },
            ],
            durations: vec![],
        };
        assert_eq!(hist.most_popular().unwrap().duration, 40);
    }

    #[test]
    fn test_snap() {
        assert_eq!(snap(Rational::new(2182, 91)), Rational::new(24000, 1001));
        assert_eq!(snap(Rational::new(25025, 1001).reduce()), Rational::new(25, 1));
        assert_eq!(snap(Rational::new(12, 5)), Rational::new(12, 5));
    }

    #[test]
    fn test_expected_frame_duration() {
        let params = input(Rational::new(1, 90_000), Rational::new(25, 1));
        assert_eq!(params.expected_frame_duration(), 3600);
        let unknown = input(Rational::new(1, 90_000), Rational::new(0, 0));
        assert_eq!(unknown.expected_frame_duration(), 1);
    }
}
