//! Per-output channel combining
//!
//! Every output mixes the contributions of all sources.  A contribution
//! reports one of five modes for the current block; changed contributions
//! are blended with an equal-power raised-cosine crossfade between their
//! previous-block rendering and their new-block rendering.

use std::sync::Arc;

use sf_core::{math, Sample};

/// How a contribution enters the mix for the current block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrossfadeMode {
    /// Contribution is and stays silent; skip entirely
    #[default]
    Nothing,
    /// Contribution unchanged; add its block as-is
    Constant,
    /// Contribution changed; crossfade old rendering to new rendering
    Change,
    /// Contribution becomes active; fade the new rendering in
    FadeIn,
    /// Contribution becomes inactive; fade the old rendering out
    FadeOut,
}

/// Raised-cosine crossfade tables.
///
/// Holds `block_size + 1` samples so the same data serves fade-out (read
/// forward from 1 down to just above 0) and fade-in (read in reverse).
/// `fade_out[i] + fade_in[i] == 1` for all i, making simultaneous fade-in
/// and fade-out of the same signal lossless.
pub struct RaisedCosineFade {
    data: Vec<Sample>,
}

impl RaisedCosineFade {
    pub fn new(block_size: usize) -> Self {
        let period = (2 * block_size) as Sample;
        let data = (0..=block_size)
            .map(|i| math::raised_cosine(i as Sample, period))
            .collect();
        Self { data }
    }

    pub fn size(&self) -> usize {
        self.data.len() - 1
    }

    /// Fade-out weight at sample `i` (starts at 1).
    #[inline]
    pub fn fade_out(&self, i: usize) -> Sample {
        self.data[i]
    }

    /// Fade-in weight at sample `i` (ends just below 1); the same samples
    /// as fade-out, read in reverse.
    #[inline]
    pub fn fade_in(&self, i: usize) -> Sample {
        self.data[self.size() - i]
    }
}

/// One contribution to an output channel.
pub trait Contribution {
    /// The mode for the current block.  For every mode that reads the old
    /// rendering (`Constant`, `Change`, `FadeOut`) the previous-parameter
    /// block must already be rendered and reachable through
    /// [`block`](Self::block).
    fn select(&self) -> CrossfadeMode;

    /// The most recent rendering of this contribution.
    fn block(&self) -> &[Sample];

    /// Re-render with the current (new) parameters; afterwards
    /// [`block`](Self::block) returns the new rendering.
    fn update(&self);
}

/// Mixes contributions into one output buffer.
pub struct ChannelCombiner {
    fade: Arc<RaisedCosineFade>,
    fade_in_buffer: Vec<Sample>,
    fade_out_buffer: Vec<Sample>,
}

impl ChannelCombiner {
    pub fn new(fade: Arc<RaisedCosineFade>) -> Self {
        let size = fade.size();
        Self {
            fade,
            fade_in_buffer: vec![0.0; size],
            fade_out_buffer: vec![0.0; size],
        }
    }

    /// Combine all contributions into `out`.
    ///
    /// The output is overwritten; it is set to zero if and only if no
    /// contribution produced output.
    pub fn process<'a, C, I>(&mut self, contributions: I, out: &mut [Sample])
    where
        C: Contribution + 'a,
        I: IntoIterator<Item = &'a C>,
    {
        debug_assert_eq!(out.len(), self.fade.size());

        let mut accumulate = false;
        let mut accumulate_fade = false;
        self.fade_in_buffer.fill(0.0);
        self.fade_out_buffer.fill(0.0);

        for item in contributions {
            match item.select() {
                CrossfadeMode::Nothing => continue,
                CrossfadeMode::Constant => {
                    add_or_copy(item.block(), out, &mut accumulate);
                }
                CrossfadeMode::Change => {
                    add(item.block(), &mut self.fade_out_buffer);
                    item.update();
                    add(item.block(), &mut self.fade_in_buffer);
                    accumulate_fade = true;
                }
                CrossfadeMode::FadeOut => {
                    add(item.block(), &mut self.fade_out_buffer);
                    accumulate_fade = true;
                }
                CrossfadeMode::FadeIn => {
                    item.update();
                    add(item.block(), &mut self.fade_in_buffer);
                    accumulate_fade = true;
                }
            }
        }

        if accumulate_fade {
            if accumulate {
                for (i, dst) in out.iter_mut().enumerate() {
                    *dst += self.fade_out_buffer[i] * self.fade.fade_out(i)
                        + self.fade_in_buffer[i] * self.fade.fade_in(i);
                }
            } else {
                for (i, dst) in out.iter_mut().enumerate() {
                    *dst = self.fade_out_buffer[i] * self.fade.fade_out(i)
                        + self.fade_in_buffer[i] * self.fade.fade_in(i);
                }
                accumulate = true;
            }
        }

        if !accumulate {
            out.fill(0.0);
        }
    }
}

#[inline]
fn add(src: &[Sample], dst: &mut [Sample]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

#[inline]
fn add_or_copy(src: &[Sample], dst: &mut [Sample], accumulate: &mut bool) {
    if *accumulate {
        add(src, dst);
    } else {
        dst[..src.len()].copy_from_slice(src);
        *accumulate = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, UnsafeCell};

    struct TestChannel {
        mode: CrossfadeMode,
        new: Vec<Sample>,
        current: UnsafeCell<Vec<Sample>>,
        updated: Cell<bool>,
    }

    impl TestChannel {
        fn new(mode: CrossfadeMode, old: Vec<Sample>, new: Vec<Sample>) -> Self {
            Self {
                mode,
                new,
                current: UnsafeCell::new(old),
                updated: Cell::new(false),
            }
        }
    }

    // Single-threaded test stand-in for the interior-mutable render
    // channels of the real renderers.
    impl Contribution for TestChannel {
        fn select(&self) -> CrossfadeMode {
            self.mode
        }

        fn block(&self) -> &[Sample] {
            unsafe { &*self.current.get() }
        }

        fn update(&self) {
            unsafe { (*self.current.get()).clone_from(&self.new) };
            self.updated.set(true);
        }
    }

    // Fading one unit signal out while fading another in sums to one
    // everywhere (raised-cosine identity).
    #[test]
    fn test_crossfade_identity() {
        let block = 4;
        let fade = Arc::new(RaisedCosineFade::new(block));
        let mut combiner = ChannelCombiner::new(Arc::clone(&fade));

        let channels = vec![
            TestChannel::new(CrossfadeMode::FadeOut, vec![1.0; block], vec![1.0; block]),
            TestChannel::new(CrossfadeMode::FadeIn, vec![1.0; block], vec![1.0; block]),
        ];

        let mut out = vec![0.0; block];
        combiner.process(channels.iter(), &mut out);

        for (i, v) in out.iter().enumerate() {
            assert!((v - 1.0).abs() < 1e-6, "sample {i}: {v}");
        }
    }

    #[test]
    fn test_constant_accumulates() {
        let block = 4;
        let fade = Arc::new(RaisedCosineFade::new(block));
        let mut combiner = ChannelCombiner::new(fade);

        let channels = vec![
            TestChannel::new(CrossfadeMode::Constant, vec![1.0; block], vec![]),
            TestChannel::new(CrossfadeMode::Constant, vec![2.0; block], vec![]),
        ];

        let mut out = vec![9.0; block];
        combiner.process(channels.iter(), &mut out);
        assert_eq!(out, vec![3.0; block]);
    }

    #[test]
    fn test_nothing_zeroes_output() {
        let block = 4;
        let fade = Arc::new(RaisedCosineFade::new(block));
        let mut combiner = ChannelCombiner::new(fade);

        let channels = vec![TestChannel::new(CrossfadeMode::Nothing, vec![1.0; block], vec![])];

        let mut out = vec![5.0; block];
        combiner.process(channels.iter(), &mut out);
        assert_eq!(out, vec![0.0; block]);
    }

    #[test]
    fn test_change_crossfades_old_to_new() {
        let block = 8;
        let fade = Arc::new(RaisedCosineFade::new(block));
        let mut combiner = ChannelCombiner::new(Arc::clone(&fade));

        let channels = vec![TestChannel::new(
            CrossfadeMode::Change,
            vec![1.0; block],
            vec![3.0; block],
        )];

        let mut out = vec![0.0; block];
        combiner.process(channels.iter(), &mut out);
        assert!(channels[0].updated.get());

        for (i, v) in out.iter().enumerate() {
            let expected = 1.0 * fade.fade_out(i) + 3.0 * fade.fade_in(i);
            assert!((v - expected).abs() < 1e-6, "sample {i}");
        }
        // first sample is dominated by the old value, last by the new
        assert!(out[0] < 1.1);
        assert!(out[block - 1] > 2.8);
    }

    #[test]
    fn test_fade_in_calls_update() {
        let block = 4;
        let fade = Arc::new(RaisedCosineFade::new(block));
        let mut combiner = ChannelCombiner::new(Arc::clone(&fade));

        let channels = vec![TestChannel::new(
            CrossfadeMode::FadeIn,
            vec![7.0; block], // stale, must not be used
            vec![1.0; block],
        )];

        let mut out = vec![0.0; block];
        combiner.process(channels.iter(), &mut out);
        assert!(channels[0].updated.get());

        for (i, v) in out.iter().enumerate() {
            let expected = fade.fade_in(i);
            assert!((v - expected).abs() < 1e-6, "sample {i}");
        }
    }

    #[test]
    fn test_fade_tables() {
        let fade = RaisedCosineFade::new(8);
        assert!((fade.fade_out(0) - 1.0).abs() < 1e-6);
        assert!(fade.fade_in(0).abs() < 1e-6);
        for i in 0..8 {
            assert!((fade.fade_out(i) + fade.fade_in(i) - 1.0).abs() < 1e-6);
        }
    }
}
