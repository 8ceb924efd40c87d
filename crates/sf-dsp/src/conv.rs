//! Partitioned frequency-domain convolution
//!
//! A convolution engine consists of an [`Input`], a filter ([`Filter`] for
//! time-varying coefficients, [`Partitions`] for static ones) and an
//! [`Output`].  One input may feed several outputs, and filters may be
//! shared.
//!
//! Uses uniformly partitioned convolution with 50% overlap: every
//! partition holds the transform of `2 * block_size` samples.  Spectra are
//! stored in a packed layout (see below) so that the complex
//! multiply-accumulate runs on four-wide SIMD lanes without shuffling.

use std::collections::VecDeque;
use std::sync::Arc;

use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use wide::f32x4;

use sf_core::{math, Sample};

use crate::{DspError, DspResult};

/// Number of partitions needed for a filter of the given length.
pub fn min_partitions(block_size: usize, filter_size: usize) -> usize {
    (filter_size + block_size - 1) / block_size
}

// ============ FftNode ============

/// Two blocks of time-domain samples or one packed spectrum.
///
/// The `zero` flag allows saving computation: if it is set, consumers must
/// treat the buffer as all-zeros regardless of its contents.
#[derive(Clone)]
pub struct FftNode {
    data: Vec<Sample>,
    zero: bool,
}

impl FftNode {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0.0; size],
            zero: true,
        }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.zero
    }

    #[inline]
    pub fn data(&self) -> &[Sample] {
        &self.data
    }

    fn set_zero(&mut self) {
        self.zero = true;
    }

    fn set_non_zero(&mut self) {
        self.zero = false;
    }

    /// Assignment: copies the zero flag and skips the payload copy for
    /// zero-flagged sources.
    fn assign(&mut self, rhs: &FftNode) {
        debug_assert_eq!(self.data.len(), rhs.data.len());
        if rhs.zero {
            self.set_zero();
        } else {
            self.data.copy_from_slice(&rhs.data);
            self.set_non_zero();
        }
    }
}

// ============ packed spectrum layout ============

// A real FFT of length 2B yields B+1 complex bins.  They are packed into
// 2B floats in groups of eight, [R R R R | I I I I], with the DC bin in
// slot 0 and the Nyquist bin (both purely real) in slot 4 of the first
// group.  The pointwise product of two packed spectra is then four SIMD
// multiplies per group, with DC and Nyquist patched around the loop.

fn sort_coefficients(spectrum: &[Complex<Sample>], out: &mut [Sample]) {
    let block_size = out.len() / 2;
    debug_assert_eq!(spectrum.len(), block_size + 1);

    out[0] = spectrum[0].re;
    out[1] = spectrum[1].re;
    out[2] = spectrum[2].re;
    out[3] = spectrum[3].re;
    out[4] = spectrum[block_size].re;
    out[5] = spectrum[1].im;
    out[6] = spectrum[2].im;
    out[7] = spectrum[3].im;

    for group in 1..block_size / 4 {
        let base = 8 * group;
        let bin = 4 * group;
        for i in 0..4 {
            out[base + i] = spectrum[bin + i].re;
            out[base + 4 + i] = spectrum[bin + i].im;
        }
    }
}

fn unsort_coefficients(data: &[Sample], spectrum: &mut [Complex<Sample>]) {
    let block_size = data.len() / 2;
    debug_assert_eq!(spectrum.len(), block_size + 1);

    spectrum[0] = Complex::new(data[0], 0.0);
    spectrum[1] = Complex::new(data[1], data[5]);
    spectrum[2] = Complex::new(data[2], data[6]);
    spectrum[3] = Complex::new(data[3], data[7]);
    spectrum[block_size] = Complex::new(data[4], 0.0);

    for group in 1..block_size / 4 {
        let base = 8 * group;
        let bin = 4 * group;
        for i in 0..4 {
            spectrum[bin + i] = Complex::new(data[base + i], data[base + 4 + i]);
        }
    }
}

#[inline]
fn load4(s: &[Sample]) -> f32x4 {
    f32x4::from([s[0], s[1], s[2], s[3]])
}

#[inline]
fn store4(v: f32x4, s: &mut [Sample]) {
    s[..4].copy_from_slice(&v.to_array());
}

/// Pointwise complex multiply-accumulate of two packed spectra.
fn multiply_partition(acc: &mut [Sample], signal: &[Sample], filter: &[Sample]) {
    // DC and Nyquist are pure-real products, patched around the loop.
    let dc = acc[0] + signal[0] * filter[0];
    let ny = acc[4] + signal[4] * filter[4];

    let mut base = 0;
    while base < acc.len() {
        let sig_re = load4(&signal[base..]);
        let sig_im = load4(&signal[base + 4..]);
        let flt_re = load4(&filter[base..]);
        let flt_im = load4(&filter[base + 4..]);

        let acc_re = load4(&acc[base..]) + sig_re * flt_re - sig_im * flt_im;
        let acc_im = load4(&acc[base + 4..]) + sig_re * flt_im + sig_im * flt_re;

        store4(acc_re, &mut acc[base..]);
        store4(acc_im, &mut acc[base + 4..]);

        base += 8;
    }

    acc[0] = dc;
    acc[4] = ny;
}

// ============ Transform ============

/// Forward-FFT stage shared by input and filter preparation.
///
/// Owns the FFT plan and the scratch buffers; plans are cached per object,
/// creating several `Transform`s of the same size is cheap because the
/// planner shares twiddle tables.
pub struct Transform {
    block_size: usize,
    partition_size: usize,
    fft: Arc<dyn RealToComplex<Sample>>,
    time_scratch: Vec<Sample>,
    spectrum_scratch: Vec<Complex<Sample>>,
}

impl Transform {
    pub fn new(block_size: usize) -> DspResult<Self> {
        if block_size < 8 || block_size % 8 != 0 {
            return Err(DspError::InvalidBlockSize(block_size));
        }
        let partition_size = 2 * block_size;
        let fft = RealFftPlanner::<Sample>::new().plan_fft_forward(partition_size);

        Ok(Self {
            block_size,
            partition_size,
            fft,
            time_scratch: vec![0.0; partition_size],
            spectrum_scratch: vec![Complex::new(0.0, 0.0); block_size + 1],
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn partition_size(&self) -> usize {
        self.partition_size
    }

    /// Transform a node holding `partition_size` time-domain samples into
    /// the packed spectrum layout, in place.
    fn fft(&mut self, node: &mut FftNode) {
        self.time_scratch.copy_from_slice(&node.data);
        // Length mismatches cannot happen, all buffers are sized here.
        self.fft
            .process(&mut self.time_scratch, &mut self.spectrum_scratch)
            .ok();
        sort_coefficients(&self.spectrum_scratch, &mut node.data);
    }

    /// FFT of one zero-padded filter partition.  Empty chunks stay
    /// zero-flagged (the FFT of zero is zero).
    fn prepare_partition(&mut self, chunk: &[Sample], partition: &mut FftNode) {
        if chunk.is_empty() {
            partition.set_zero();
            return;
        }
        let n = chunk.len().min(self.block_size);
        partition.data[..n].copy_from_slice(&chunk[..n]);
        partition.data[n..].fill(0.0);
        self.fft(partition);
        partition.set_non_zero();
    }

    /// Transform time-domain coefficients into `partitions` packed
    /// partitions.  Too-short impulse responses are zero-padded, too-long
    /// ones are trimmed.
    pub fn prepare_partitions(&mut self, ir: &[Sample], partitions: usize) -> Partitions {
        let mut nodes: Vec<FftNode> = (0..partitions)
            .map(|_| FftNode::new(self.partition_size))
            .collect();

        for (k, node) in nodes.iter_mut().enumerate() {
            let start = (k * self.block_size).min(ir.len());
            let end = ((k + 1) * self.block_size).min(ir.len());
            self.prepare_partition(&ir[start..end], node);
        }

        Partitions {
            block_size: self.block_size,
            nodes,
        }
    }
}

// ============ filter spectra ============

/// Read access to the currently active filter partitions.
pub trait FilterSpectra {
    fn block_size(&self) -> usize;
    fn partitions(&self) -> usize;
    /// The active spectrum of partition `k`.
    fn partition(&self, k: usize) -> &FftNode;
}

/// A static, fully prepared partitioned filter.
pub struct Partitions {
    block_size: usize,
    nodes: Vec<FftNode>,
}

impl Partitions {
    /// Static filter from time-domain coefficients.
    pub fn from_time_domain(block_size: usize, ir: &[Sample]) -> DspResult<Self> {
        let mut transform = Transform::new(block_size)?;
        let count = min_partitions(block_size, ir.len()).max(1);
        Ok(transform.prepare_partitions(ir, count))
    }

    /// All-zero filter of the given shape, e.g. as interpolation scratch.
    pub fn silence(block_size: usize, partitions: usize) -> DspResult<Self> {
        if block_size < 8 || block_size % 8 != 0 {
            return Err(DspError::InvalidBlockSize(block_size));
        }
        Ok(Self {
            block_size,
            nodes: (0..partitions).map(|_| FftNode::new(2 * block_size)).collect(),
        })
    }

    /// Overwrite with the elementwise blend `(1 - t) * a + t * b`.
    ///
    /// Spectra are linear, so blending packed partitions is equivalent to
    /// blending the impulse responses.  Zero-flagged partitions count as
    /// zeros; partitions beyond the length of `a` or `b` count as zeros as
    /// well.
    pub fn interpolate_from(&mut self, a: &Partitions, b: &Partitions, t: Sample) {
        let one_minus = 1.0 - t;
        for (k, node) in self.nodes.iter_mut().enumerate() {
            let pa = a.nodes.get(k).filter(|n| !n.is_zero());
            let pb = b.nodes.get(k).filter(|n| !n.is_zero());
            match (pa, pb) {
                (None, None) => node.set_zero(),
                (Some(pa), None) => {
                    for (dst, &x) in node.data.iter_mut().zip(&pa.data) {
                        *dst = one_minus * x;
                    }
                    node.set_non_zero();
                }
                (None, Some(pb)) => {
                    for (dst, &x) in node.data.iter_mut().zip(&pb.data) {
                        *dst = t * x;
                    }
                    node.set_non_zero();
                }
                (Some(pa), Some(pb)) => {
                    for ((dst, &x), &y) in node.data.iter_mut().zip(&pa.data).zip(&pb.data) {
                        *dst = one_minus * x + t * y;
                    }
                    node.set_non_zero();
                }
            }
        }
    }
}

impl FilterSpectra for Partitions {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn partitions(&self) -> usize {
        self.nodes.len()
    }

    fn partition(&self, k: usize) -> &FftNode {
        &self.nodes[k]
    }
}

// ============ Input ============

/// Input stage: new audio blocks are fed in here.
///
/// Holds the spectra of the last `partitions` double-blocks of the input
/// signal plus one element for the partially assembled upcoming partition
/// (the 50% overlap).
pub struct Input {
    transform: Transform,
    /// Front is the most recent spectrum; `partitions + 1` elements.
    spectra: VecDeque<FftNode>,
}

impl Input {
    pub fn new(block_size: usize, partitions: usize) -> DspResult<Self> {
        assert!(partitions > 0);
        let transform = Transform::new(block_size)?;
        let spectra = (0..partitions + 1)
            .map(|_| FftNode::new(transform.partition_size()))
            .collect();

        Ok(Self { transform, spectra })
    }

    pub fn block_size(&self) -> usize {
        self.transform.block_size()
    }

    pub fn partitions(&self) -> usize {
        self.spectra.len() - 1
    }

    /// Spectrum of the block `k` periods ago (0 = most recent).
    pub(crate) fn spectrum(&self, k: usize) -> &FftNode {
        &self.spectra[k]
    }

    /// Add one block of time-domain input samples.
    pub fn add_block(&mut self, src: &[Sample]) {
        let block_size = self.block_size();
        debug_assert_eq!(src.len(), block_size);

        // Rotate: the oldest spectrum becomes the upcoming partition's
        // assembly area, the previous assembly area becomes "current".
        if let Some(recycled) = self.spectra.pop_back() {
            self.spectra.push_front(recycled);
        }
        let last = self.spectra.len() - 1;

        if math::has_only_zeros(src) {
            self.spectra[last].set_zero();

            if !self.spectra[0].is_zero() {
                // First half is valid data, second half must be zeroed.
                let current = &mut self.spectra[0];
                let half = block_size;
                current.data[half..].fill(0.0);
            }
        } else {
            if self.spectra[0].is_zero() {
                // The zero flag only promises zeros, make them real.
                self.spectra[0].data[..block_size].fill(0.0);
            }
            // Second half of the current partition...
            self.spectra[0].data[block_size..].copy_from_slice(src);
            self.spectra[0].set_non_zero();
            // ...and first half of the upcoming one.
            self.spectra[last].data[..block_size].copy_from_slice(src);
            self.spectra[last].set_non_zero();
        }

        if !self.spectra[0].is_zero() {
            if let Some(mut current) = self.spectra.pop_front() {
                self.transform.fft(&mut current);
                self.spectra.push_front(current);
            }
        }
    }
}

// ============ Filter ============

/// One queued slot of a time-varying filter partition.
struct QueueSlot {
    node: FftNode,
    /// Whether this slot holds a staged update travelling to the front.
    staged: bool,
}

/// Time-varying filter: one queue per partition, the k-th queue has depth
/// k + 1.
///
/// The queue depths make time-aligned filter updates possible: a filter
/// set at block t is fully in effect after `partitions - 1` calls to
/// [`rotate_queues`](Self::rotate_queues); in between, the partitions
/// switch over one by one, oldest first.
pub struct Filter {
    transform: Transform,
    /// Queue k has k + 1 slots; the front slot is the active partition.
    queues: Vec<VecDeque<QueueSlot>>,
}

impl Filter {
    /// Create a filter with all partitions zeroed (silence until
    /// [`set_filter`](Self::set_filter) is called).
    pub fn new(block_size: usize, partitions: usize) -> DspResult<Self> {
        assert!(partitions > 0);
        let transform = Transform::new(block_size)?;
        let partition_size = transform.partition_size();
        let queues = (0..partitions)
            .map(|k| {
                (0..k + 1)
                    .map(|_| QueueSlot {
                        node: FftNode::new(partition_size),
                        staged: false,
                    })
                    .collect()
            })
            .collect();

        Ok(Self { transform, queues })
    }

    /// Set a new filter from time-domain coefficients.
    ///
    /// The first partition is updated immediately, the later partitions
    /// become audible through [`rotate_queues`](Self::rotate_queues).
    /// Zero padding and trimming happen automatically.
    pub fn set_filter(&mut self, ir: &[Sample]) {
        let block_size = self.transform.block_size();
        for k in 0..self.queues.len() {
            let start = (k * block_size).min(ir.len());
            let end = ((k + 1) * block_size).min(ir.len());
            let queue = &mut self.queues[k];
            let back = queue.len() - 1;
            // Split borrow: transform scratch vs. queue storage.
            let slot = &mut queue[back];
            self.transform.prepare_partition(&ir[start..end], &mut slot.node);
            slot.staged = true;
        }
    }

    /// Set a new filter from already prepared partitions.  Missing
    /// partitions are zeroed, surplus ones are ignored.
    pub fn set_filter_partitions(&mut self, partitions: &Partitions) {
        debug_assert_eq!(partitions.block_size, self.transform.block_size());
        for (k, queue) in self.queues.iter_mut().enumerate() {
            let back = queue.len() - 1;
            let slot = &mut queue[back];
            if k < partitions.nodes.len() {
                slot.node.assign(&partitions.nodes[k]);
            } else {
                slot.node.set_zero();
            }
            slot.staged = true;
        }
    }

    /// Check if filter updates are still travelling through the queues.
    ///
    /// If this returns true, [`rotate_queues`](Self::rotate_queues) is a
    /// no-op on the convolution result.  This matters for crossfades: as
    /// long as the queues are not empty, older partitions keep changing
    /// even without further `set_filter` calls.
    pub fn queues_empty(&self) -> bool {
        self.queues
            .iter()
            .all(|q| q.iter().skip(1).all(|slot| !slot.staged))
    }

    /// Advance every queue by one slot.
    ///
    /// Only queues with staged updates move; within such a queue the
    /// staged partition travels one slot toward the front per call.
    /// Swapping becomes audible, so a crossfade is recommended.
    pub fn rotate_queues(&mut self) {
        for queue in &mut self.queues {
            if queue.len() < 2 || queue.iter().skip(1).all(|slot| !slot.staged) {
                continue;
            }
            if queue[1].staged {
                // The next slot is a staged update: promote it and recycle
                // the current front at the back of the queue.
                if let Some(mut front) = queue.pop_front() {
                    front.staged = false;
                    queue.push_back(front);
                }
            } else {
                // The next slot is stale: push it out of the way so the
                // staged update comes one step closer.
                if let Some(stale) = queue.remove(1) {
                    queue.push_back(stale);
                }
            }
        }
    }
}

impl FilterSpectra for Filter {
    fn block_size(&self) -> usize {
        self.transform.block_size()
    }

    fn partitions(&self) -> usize {
        self.queues.len()
    }

    fn partition(&self, k: usize) -> &FftNode {
        &self.queues[k][0].node
    }
}

// ============ Output ============

/// Output stage: multiplies input spectra with filter partitions and
/// transforms back.
///
/// One `Input` may be convolved against multiple filters concurrently as
/// long as each `Output` lives on a single thread; the input must not be
/// written while being read.
pub struct Output {
    block_size: usize,
    partitions: usize,
    /// Packed multiply-accumulate buffer
    accumulator: FftNode,
    ifft: Arc<dyn ComplexToReal<Sample>>,
    spectrum_scratch: Vec<Complex<Sample>>,
    /// Inverse-transform result; the first half is the discarded overlap
    time_buffer: Vec<Sample>,
}

impl Output {
    pub fn new(input: &Input) -> Self {
        let block_size = input.block_size();
        let partition_size = 2 * block_size;
        let ifft = RealFftPlanner::<Sample>::new().plan_fft_inverse(partition_size);

        Self {
            block_size,
            partitions: input.partitions(),
            accumulator: FftNode::new(partition_size),
            ifft,
            spectrum_scratch: vec![Complex::new(0.0, 0.0); block_size + 1],
            time_buffer: vec![0.0; partition_size],
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Fast convolution of one audio block; returns the weighted result
    /// (`block_size` samples).
    pub fn convolve(
        &mut self,
        input: &Input,
        filter: &impl FilterSpectra,
        weight: Sample,
    ) -> &[Sample] {
        assert_eq!(input.partitions(), self.partitions);
        assert_eq!(filter.partitions(), self.partitions);
        assert_eq!(filter.block_size(), self.block_size);

        self.accumulator.data.fill(0.0);
        self.accumulator.set_zero();

        for k in 0..self.partitions {
            let signal = input.spectrum(k);
            let partition = filter.partition(k);
            if signal.is_zero() || partition.is_zero() {
                continue;
            }
            self.accumulator.set_non_zero();
            multiply_partition(&mut self.accumulator.data, &signal.data, &partition.data);
        }

        let second_half = self.block_size;

        if self.accumulator.is_zero() {
            // The inverse FFT of zero is zero.
            self.time_buffer.fill(0.0);
        } else {
            unsort_coefficients(&self.accumulator.data, &mut self.spectrum_scratch);
            self.ifft
                .process(&mut self.spectrum_scratch, &mut self.time_buffer)
                .ok();

            // The inverse transform is unnormalized.
            let norm = weight / (2 * self.block_size) as Sample;
            for sample in &mut self.time_buffer[second_half..] {
                *sample *= norm;
            }
        }

        &self.time_buffer[second_half..]
    }

    /// The result of the most recent [`convolve`](Self::convolve) call.
    pub fn last_block(&self) -> &[Sample] {
        &self.time_buffer[self.block_size..]
    }
}

// ============ StaticConvolver ============

/// Input, static filter and output in one package, for per-channel FIR
/// filtering with fixed coefficients.
pub struct StaticConvolver {
    input: Input,
    filter: Arc<Partitions>,
    output: Output,
}

impl StaticConvolver {
    /// Convolver from time-domain coefficients.
    pub fn new(block_size: usize, ir: &[Sample]) -> DspResult<Self> {
        Self::with_partitions(Arc::new(Partitions::from_time_domain(block_size, ir)?))
    }

    /// Convolver sharing an already prepared filter.
    pub fn with_partitions(filter: Arc<Partitions>) -> DspResult<Self> {
        let input = Input::new(filter.block_size, filter.partitions())?;
        let output = Output::new(&input);
        Ok(Self {
            input,
            filter,
            output,
        })
    }

    pub fn add_block(&mut self, src: &[Sample]) {
        self.input.add_block(src);
    }

    pub fn convolve(&mut self, weight: Sample) -> &[Sample] {
        self.output.convolve(&self.input, &*self.filter, weight)
    }

    /// The result of the most recent [`convolve`](Self::convolve) call.
    pub fn last_block(&self) -> &[Sample] {
        self.output.last_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convolve_block(input: &mut Input, output: &mut Output, filter: &impl FilterSpectra, block: &[Sample]) -> Vec<Sample> {
        input.add_block(block);
        output.convolve(input, filter, 1.0).to_vec()
    }

    // A dirac filter passes blocks through verbatim, with no block delay.
    #[test]
    fn test_dirac_identity() {
        let mut input = Input::new(8, 1).unwrap();
        let filter = Partitions::from_time_domain(8, &[1.0]).unwrap();
        let mut output = Output::new(&input);

        let block1 = [0.0, 0.0, 0.0, 0.0, 0.0, 0.1, 0.2, 0.3];
        let block2 = [0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 0.0, 0.0];

        for block in [&block1[..], &block2[..]] {
            let result = convolve_block(&mut input, &mut output, &filter, block);
            for (r, x) in result.iter().zip(block) {
                assert!((r - x).abs() < 1e-6, "{r} vs {x}");
            }
        }
    }

    // Taps in the second partition appear one block later.
    #[test]
    fn test_second_partition_taps() {
        let mut ir = vec![0.0; 16];
        ir[10] = 5.0;
        ir[11] = 4.0;
        ir[12] = 3.0;

        let mut input = Input::new(8, 2).unwrap();
        let filter = Partitions::from_time_domain(8, &ir).unwrap();
        let mut output = Output::new(&input);

        let mut impulse = [0.0; 8];
        impulse[1] = 1.0;

        let block0 = convolve_block(&mut input, &mut output, &filter, &impulse);
        assert!(block0.iter().all(|x| x.abs() < 1e-5), "{block0:?}");

        let block1 = convolve_block(&mut input, &mut output, &filter, &[0.0; 8]);
        let mut expected = [0.0; 8];
        expected[3] = 5.0;
        expected[4] = 4.0;
        expected[5] = 3.0;
        for (r, e) in block1.iter().zip(&expected) {
            assert!((r - e).abs() < 1e-4, "{block1:?}");
        }
    }

    // Convolution is linear in the filter coefficients.
    #[test]
    fn test_linearity() {
        let block_size = 16;
        let f1: Vec<Sample> = (0..40).map(|i| ((i * 7 + 3) % 11) as Sample / 11.0).collect();
        let f2: Vec<Sample> = (0..40).map(|i| ((i * 5 + 1) % 13) as Sample / 13.0 - 0.4).collect();
        let x: Vec<Sample> = (0..block_size).map(|i| ((i * 3 + 2) % 7) as Sample / 7.0 - 0.5).collect();

        let (alpha, beta) = (0.75, -0.5);
        let mix: Vec<Sample> = f1.iter().zip(&f2).map(|(a, b)| alpha * a + beta * b).collect();

        let run = |ir: &[Sample]| -> Vec<Sample> {
            let mut input = Input::new(block_size, 3).unwrap();
            let mut transform = Transform::new(block_size).unwrap();
            let filter = transform.prepare_partitions(ir, 3);
            let mut output = Output::new(&input);
            let mut out = Vec::new();
            for _ in 0..3 {
                input.add_block(&x);
                out.extend_from_slice(output.convolve(&input, &filter, 1.0));
            }
            out
        };

        let y1 = run(&f1);
        let y2 = run(&f2);
        let y_mix = run(&mix);

        for i in 0..y_mix.len() {
            let expected = alpha * y1[i] + beta * y2[i];
            assert!(
                (y_mix[i] - expected).abs() < 1e-5 * expected.abs().max(1.0),
                "sample {i}: {} vs {}",
                y_mix[i],
                expected
            );
        }
    }

    // Reference direct convolution for cross-checking.
    fn direct_convolve(ir: &[Sample], x: &[Sample]) -> Vec<Sample> {
        let mut y = vec![0.0; x.len()];
        for (n, out) in y.iter_mut().enumerate() {
            for (k, h) in ir.iter().enumerate() {
                if n >= k {
                    *out += h * x[n - k];
                }
            }
        }
        y
    }

    #[test]
    fn test_matches_direct_convolution() {
        let block_size = 8;
        let ir: Vec<Sample> = (0..20).map(|i| (i as Sample * 0.37).sin()).collect();
        let x: Vec<Sample> = (0..32).map(|i| (i as Sample * 0.83).cos()).collect();

        let mut input = Input::new(block_size, min_partitions(block_size, ir.len())).unwrap();
        let filter = Partitions::from_time_domain(block_size, &ir).unwrap();
        let mut output = Output::new(&input);

        let mut y = Vec::new();
        for block in x.chunks(block_size) {
            input.add_block(block);
            y.extend_from_slice(output.convolve(&input, &filter, 1.0));
        }

        let reference = direct_convolve(&ir, &x);
        for (i, (a, b)) in y.iter().zip(&reference).enumerate() {
            assert!((a - b).abs() < 1e-4, "sample {i}: {a} vs {b}");
        }
    }

    // A new filter is fully in effect after P-1 rotations, switching
    // over partition by partition in between.
    #[test]
    fn test_dynamic_filter_timing() {
        let block_size = 8;
        let partitions = 4;

        let mut input = Input::new(block_size, partitions).unwrap();
        let mut filter = Filter::new(block_size, partitions).unwrap();
        let mut output = Output::new(&input);

        // All partitions of the old filter are non-zero.
        let old_ir = vec![0.25; block_size * partitions];
        filter.set_filter(&old_ir);
        while !filter.queues_empty() {
            filter.rotate_queues();
        }

        let new_ir = vec![-0.5; block_size * partitions];
        filter.set_filter(&new_ir);

        // Feed a constant signal long enough that all partitions carry it.
        let ones = vec![1.0; block_size];
        for _ in 0..partitions {
            input.add_block(&ones);
        }

        let expected_total = |new_parts: usize| -> Sample {
            // Each partition contributes block_size taps of the input sum.
            let old = (partitions - new_parts) as Sample * block_size as Sample * 0.25;
            let new = new_parts as Sample * block_size as Sample * -0.5;
            old + new
        };

        for rotation in 0..partitions {
            // Partition 0 is already new, partitions above `rotation` are
            // still old.
            let result = output.convolve(&input, &filter, 1.0).to_vec();
            let expected = expected_total(rotation + 1);
            assert!(
                (result[block_size - 1] - expected).abs() < 1e-3,
                "rotation {rotation}: {} vs {expected}",
                result[block_size - 1]
            );
            filter.rotate_queues();
        }
        assert!(filter.queues_empty());

        // Rotating settled queues is a no-op on the output.
        let before = output.convolve(&input, &filter, 1.0).to_vec();
        filter.rotate_queues();
        let after = output.convolve(&input, &filter, 1.0).to_vec();
        assert_eq!(before, after);
    }

    #[test]
    fn test_zero_input_stays_zero_flagged() {
        let mut input = Input::new(8, 2).unwrap();
        let filter = Partitions::from_time_domain(8, &[1.0, 0.5, 0.25]).unwrap();
        let mut output = Output::new(&input);

        input.add_block(&[0.0; 8]);
        let out = output.convolve(&input, &filter, 1.0);
        assert!(out.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_weight_scales_output() {
        let mut input = Input::new(8, 1).unwrap();
        let filter = Partitions::from_time_domain(8, &[1.0]).unwrap();
        let mut output = Output::new(&input);

        let block: Vec<Sample> = (0..8).map(|i| i as Sample).collect();
        input.add_block(&block);
        let out = output.convolve(&input, &filter, 0.5).to_vec();
        for (r, x) in out.iter().zip(&block) {
            assert!((r - 0.5 * x).abs() < 1e-5);
        }
    }

    #[test]
    fn test_invalid_block_size() {
        assert!(matches!(
            Input::new(12, 1),
            Err(DspError::InvalidBlockSize(12))
        ));
        assert!(matches!(
            Input::new(0, 1),
            Err(DspError::InvalidBlockSize(0))
        ));
    }

    #[test]
    fn test_static_convolver() {
        let mut conv = StaticConvolver::new(8, &[0.0, 1.0]).unwrap();
        let block: Vec<Sample> = (1..=8).map(|i| i as Sample).collect();
        conv.add_block(&block);
        let out = conv.convolve(1.0);
        // One-sample delay.
        assert!((out[0] - 0.0).abs() < 1e-5);
        for i in 1..8 {
            assert!((out[i] - block[i - 1]).abs() < 1e-5);
        }
    }
}
