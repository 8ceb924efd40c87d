//! Near-field-compensated higher-order Ambisonics renderer
//!
//! Every source is decomposed into circular harmonic modes; each mode runs
//! a near-field-compensation biquad cascade whose coefficients depend on
//! the source distance and the array radius.  Modes are rotated by the
//! source azimuth, accumulated over all sources, and transformed onto the
//! loudspeaker ring with one inverse real FFT per sample instant.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use realfft::{ComplexToReal, RealFftPlanner};
use rustfft::num_complex::Complex;

use sf_core::{math, Orientation, Params, Sample, SourceModel, SPEED_OF_SOUND};
use sf_dsp::biquad::{Cascade, SosCoefficients};
use sf_dsp::nfc::NfcCoefficients;
use sf_rt::{AudioBackend, NullBackend, Processable, RtCell, RtList};

use crate::base::{
    ChannelList, InputItem, OutputBase, RenderOutput, RenderSource, RendererBase, SourceBase,
    SourceParams,
};
use crate::{LoudspeakerSetup, RenderError, RenderResult};

/// NFC-HOA renderer over a circular (counterclockwise) loudspeaker array.
pub struct NfcHoaRenderer {
    base: RendererBase<HoaSource, HoaOutput>,
    mode_list: Arc<RtList<Arc<HoaMode>>>,
    accumulator_list: Arc<RtList<Arc<ModeAccumulator>>>,
    fft_list: Arc<RtList<Arc<FftSlice>>>,
    accumulators: Vec<Arc<ModeAccumulator>>,
    /// Ambisonics order (loudspeakers / 2)
    order: usize,
    array_radius: Sample,
    sources: Mutex<HashMap<u32, HoaSourceWiring>>,
}

struct HoaSourceWiring {
    modes: Vec<Arc<HoaMode>>,
    mode_keys: Vec<usize>,
}

impl NfcHoaRenderer {
    pub fn new(params: &Params) -> RenderResult<Self> {
        Self::with_backend(params, Box::new(NullBackend))
    }

    pub fn with_backend(params: &Params, backend: Box<dyn AudioBackend>) -> RenderResult<Self> {
        let base: RendererBase<HoaSource, HoaOutput> = RendererBase::new(params, backend)?;
        let fifo = Arc::clone(base.fifo());
        Ok(Self {
            base,
            mode_list: RtList::new(Arc::clone(&fifo)),
            accumulator_list: RtList::new(Arc::clone(&fifo)),
            fft_list: RtList::new(fifo),
            accumulators: Vec::new(),
            order: 0,
            array_radius: 0.0,
            sources: Mutex::new(HashMap::new()),
        })
    }

    /// Load a circular reproduction setup.  Subwoofers are not supported.
    pub fn load_reproduction_setup(&mut self, setup: &LoudspeakerSetup) -> RenderResult<()> {
        if setup.is_empty() {
            return Err(RenderError::UnsupportedSetup("empty setup".to_string()));
        }
        if setup.has_subwoofers() {
            return Err(RenderError::UnsupportedSetup(
                "subwoofers are not supported by the NFC-HOA renderer".to_string(),
            ));
        }

        let speakers = setup.len();
        let block_size = self.base.block_size();

        let total: Sample = setup
            .speakers
            .iter()
            .map(|s| s.point.position.length())
            .sum();
        self.array_radius = total / speakers as Sample;
        self.order = speakers / 2;

        log::debug!(
            "NFC-HOA: {} loudspeakers, mean radius {} m, order {}",
            speakers,
            self.array_radius,
            self.order
        );

        // One accumulator per mode.
        for mode_number in 0..=self.order {
            let accumulator = Arc::new(ModeAccumulator {
                members: ChannelList::default(),
                row: RtCell::new(vec![Complex::new(0.0, 0.0); block_size]),
                _mode_number: mode_number,
            });
            self.accumulators.push(Arc::clone(&accumulator));
            self.accumulator_list.add(accumulator);
        }

        // One inverse transform per sample instant of the block.
        let ifft = RealFftPlanner::<Sample>::new().plan_fft_inverse(speakers);
        let bins = self.order + 1;
        debug_assert_eq!(ifft.len() / 2 + 1, bins);
        let mut slices = Vec::with_capacity(block_size);
        for index in 0..block_size {
            let slice = Arc::new(FftSlice {
                index,
                accumulators: self.accumulators.clone(),
                ifft: Arc::clone(&ifft),
                spectrum: RtCell::new(vec![Complex::new(0.0, 0.0); bins]),
                row: RtCell::new(vec![0.0; speakers]),
                even_ring: speakers % 2 == 0,
            });
            slices.push(Arc::clone(&slice));
            self.fft_list.add(slice);
        }

        // One output per loudspeaker, reading its column of the slices.
        for channel_index in 0..speakers {
            let output = Arc::new(HoaOutput {
                base: OutputBase::new(block_size),
                channel_index,
                slices: slices.clone(),
            });
            self.base.add_output(output);
        }
        Ok(())
    }

    pub fn add_source(&self) -> RenderResult<u32> {
        if self.base.output_count() == 0 {
            return Err(RenderError::NoSetup);
        }

        let correction = self.base.master_volume_correction();
        let scene = Arc::clone(&self.base.state);
        let sample_rate = self.base.sample_rate() as f64;
        let array_radius = self.array_radius;
        let block_size = self.base.block_size();
        let order = self.order;

        let mut made_modes: Vec<Arc<HoaMode>> = Vec::new();
        let id = self.base.add_source_with(|params, input| {
            let shared = Arc::new(HoaShared {
                params: Arc::clone(&params),
                input: Arc::clone(&input),
                geometry: RtCell::new(HoaGeometry::reset_forcing()),
            });

            for mode_number in 0..=order {
                let sections = NfcCoefficients::sections_for_mode(mode_number);
                made_modes.push(Arc::new(HoaMode {
                    shared: Arc::clone(&shared),
                    mode_number,
                    filter: RtCell::new(Cascade::new(sections)),
                    coefficients: RtCell::new(NfcCoefficients::new(
                        mode_number,
                        sample_rate,
                        array_radius as f64,
                        SPEED_OF_SOUND as f64,
                    )),
                    old_sections: RtCell::new(vec![SosCoefficients::identity(); sections]),
                    new_sections: RtCell::new(vec![SosCoefficients::identity(); sections]),
                    buffer: RtCell::new(vec![0.0; block_size]),
                    rotation: RtCell::new(ModeRotation {
                        array_radius,
                        ..ModeRotation::default()
                    }),
                }));
            }

            Ok(Arc::new(HoaSource {
                base: SourceBase::new(params, input, scene, correction),
                shared,
            }))
        })?;

        let mode_keys = self.mode_list.add_range(made_modes.iter().cloned());
        for (mode_number, mode) in made_modes.iter().enumerate() {
            self.base.add_to_sublist(
                &self.accumulators[mode_number],
                ModeAccumulator::member_list,
                Arc::clone(mode),
            );
        }

        self.sources.lock().insert(
            id,
            HoaSourceWiring {
                modes: made_modes,
                mode_keys,
            },
        );
        Ok(id)
    }

    pub fn rem_source(&self, id: u32) -> RenderResult<()> {
        let wiring = self
            .sources
            .lock()
            .remove(&id)
            .ok_or(RenderError::UnknownSource(id))?;

        for (mode_number, mode) in wiring.modes.iter().enumerate() {
            self.base.rem_from_sublist(
                &self.accumulators[mode_number],
                ModeAccumulator::member_list,
                mode,
            );
        }
        for key in wiring.mode_keys {
            self.mode_list.rem(key);
        }
        self.base.remove_source(id)
    }

    pub fn rem_all_sources(&self) -> RenderResult<()> {
        for id in self.base.source_ids() {
            self.rem_source(id)?;
        }
        Ok(())
    }

    pub fn audio_callback(
        &self,
        frames: usize,
        inputs: &[&[Sample]],
        outputs: &mut [&mut [Sample]],
    ) -> RenderResult<()> {
        self.base.audio_callback_with(frames, inputs, outputs, |base| {
            base.process_source_list();
            base.process_aux_list(&self.mode_list);
            base.process_aux_list(&self.accumulator_list);
            base.process_aux_list(&self.fft_list);
            base.process_output_list();
        })
    }
}

impl std::ops::Deref for NfcHoaRenderer {
    type Target = RendererBase<HoaSource, HoaOutput>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl std::ops::DerefMut for NfcHoaRenderer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

// ============ per-source shared state ============

#[derive(Clone, Copy)]
struct HoaGeometry {
    distance: Sample,
    old_distance: Sample,
    /// Mode rotation angle in radians
    angle: Sample,
    old_angle: Sample,
    model: SourceModel,
    old_model: SourceModel,
    /// (old, new) weighting factor including the HOA distance correction
    weight: Sample,
    old_weight: Sample,
}

impl HoaGeometry {
    /// Impossible values force a coefficient update in the first cycle.
    fn reset_forcing() -> Self {
        Self {
            distance: -1.0,
            old_distance: -1.0,
            angle: Sample::INFINITY,
            old_angle: Sample::INFINITY,
            model: SourceModel::Point,
            old_model: SourceModel::Point,
            weight: 0.0,
            old_weight: 0.0,
        }
    }
}

struct HoaShared {
    params: Arc<SourceParams>,
    input: Arc<InputItem>,
    geometry: RtCell<HoaGeometry>,
}

// ============ source ============

/// Per-source processing: geometry evaluation for the mode filters.
pub struct HoaSource {
    base: SourceBase,
    shared: Arc<HoaShared>,
}

impl RenderSource for HoaSource {
    fn base(&self) -> &SourceBase {
        &self.base
    }
}

impl Processable for HoaSource {
    fn process(&self) {
        let g = unsafe { self.shared.geometry.get() };
        g.old_distance = g.distance;
        g.old_angle = g.angle;
        g.old_model = g.model;
        g.old_weight = g.weight;

        let (_, mut weighting) = self.base.process_weight();
        let scene = self.base.scene();
        // The reference offset is not taken into account here.
        let ref_pos = *scene.reference_position.read();
        let ref_ori = *scene.reference_orientation.read();
        let position = *self.base.params.position.read();

        g.distance = (position - ref_pos).length();
        g.model = *self.base.params.model.read();

        let source_orientation = match g.model {
            SourceModel::Point => {
                // Attenuation relative to a 25 cm near-field limit.
                let limit: Sample = 0.25;
                weighting *= (limit / g.distance.max(limit)).sqrt();
                (position - ref_pos).orientation()
            }
            // No distance attenuation for plane waves.
            SourceModel::Plane => {
                *self.base.params.orientation.read() - Orientation::new(180.0)
            }
        };

        g.angle = math::deg_to_rad(90.0 + (source_orientation - ref_ori).azimuth);
        g.weight = weighting;
    }
}

// ============ mode items ============

#[derive(Default)]
struct ModeRotation {
    rotation1: Sample,
    rotation2: Sample,
    old_rotation1: Sample,
    old_rotation2: Sample,
    /// 0 = silent, 1 = constant, 2 = interpolate
    interpolation_mode: u8,
    array_radius: Sample,
}

/// One circular harmonic of one source.
pub struct HoaMode {
    shared: Arc<HoaShared>,
    mode_number: usize,
    filter: RtCell<Cascade>,
    coefficients: RtCell<NfcCoefficients>,
    old_sections: RtCell<Vec<SosCoefficients>>,
    new_sections: RtCell<Vec<SosCoefficients>>,
    /// NFC-filtered block
    buffer: RtCell<Vec<Sample>>,
    rotation: RtCell<ModeRotation>,
}

impl Processable for HoaMode {
    fn process(&self) {
        let g = *unsafe { self.shared.geometry.get_ref() };
        let input = self.shared.input.samples();
        let output = unsafe { self.buffer.get() };
        let filter = unsafe { self.filter.get() };
        let rotation = unsafe { self.rotation.get() };

        if g.distance == g.old_distance && g.model == g.old_model {
            filter.execute(input, output);
        } else {
            // Coefficients change: interpolate them over the block, one
            // sample at a time.  The first sample still uses the old
            // coefficients.
            let coefficients = unsafe { self.coefficients.get() };
            let old_sections = unsafe { self.old_sections.get() };
            let new_sections = unsafe { self.new_sections.get() };

            old_sections.copy_from_slice(new_sections);
            // Sources inside the array radius would need focused handling;
            // clamp them onto the array for now.
            let distance = g.distance.max(rotation.array_radius) as f64;
            coefficients.reset(distance, g.model);
            new_sections.copy_from_slice(coefficients.sections());

            let block_size = input.len() as f64;
            for (i, (&x, out)) in input.iter().zip(output.iter_mut()).enumerate() {
                *out = filter.process_sample(x as f64) as Sample;
                filter.set_lerped(old_sections, new_sections, (i + 1) as f64 / block_size);
            }
        }

        // The rotation must be refreshed if the angle OR the weighting
        // factor changes.
        rotation.old_rotation1 = rotation.rotation1;
        rotation.old_rotation2 = rotation.rotation2;

        if g.angle != g.old_angle {
            let m = self.mode_number as Sample;
            rotation.rotation1 = (-m * g.angle).cos();
            rotation.rotation2 = (-m * g.angle).sin();
        }

        rotation.interpolation_mode = if g.weight == 0.0 && g.old_weight == 0.0 {
            0
        } else if g.weight == g.old_weight
            && g.angle == g.old_angle
            && g.distance == g.old_distance
            && g.model == g.old_model
        {
            1
        } else {
            2
        };
    }
}

// ============ mode accumulators ============

/// Accumulates the mode-m contribution of every source into one complex
/// row (real part = cosine mode, imaginary part = sine mode).
pub struct ModeAccumulator {
    members: ChannelList<HoaMode>,
    row: RtCell<Vec<Complex<Sample>>>,
    _mode_number: usize,
}

impl ModeAccumulator {
    fn member_list(&self) -> &ChannelList<HoaMode> {
        &self.members
    }

    fn row(&self) -> &[Complex<Sample>] {
        unsafe { self.row.get_ref() }
    }
}

impl Processable for ModeAccumulator {
    fn process(&self) {
        let row = unsafe { self.row.get() };
        let members = unsafe { self.members.get_ref() };
        let mut accumulate = false;

        for mode in members.iter() {
            let rotation = unsafe { mode.rotation.get_ref() };
            let g = unsafe { mode.shared.geometry.get_ref() };
            let block = unsafe { mode.buffer.get_ref() };

            match rotation.interpolation_mode {
                0 => continue,
                1 => {
                    let factor = Complex::new(
                        rotation.rotation1 * g.weight,
                        rotation.rotation2 * g.weight,
                    );
                    if accumulate {
                        for (dst, &x) in row.iter_mut().zip(block.iter()) {
                            *dst += factor * x;
                        }
                    } else {
                        for (dst, &x) in row.iter_mut().zip(block.iter()) {
                            *dst = factor * x;
                        }
                    }
                }
                _ => {
                    // Interpolate rotation and weight linearly across the
                    // block.
                    let first = Complex::new(
                        rotation.old_rotation1 * g.old_weight,
                        rotation.old_rotation2 * g.old_weight,
                    );
                    let last = Complex::new(
                        rotation.rotation1 * g.weight,
                        rotation.rotation2 * g.weight,
                    );
                    let step = (last - first) / block.len() as Sample;
                    if accumulate {
                        for (i, (dst, &x)) in row.iter_mut().zip(block.iter()).enumerate() {
                            *dst += (first + step * i as Sample) * x;
                        }
                    } else {
                        for (i, (dst, &x)) in row.iter_mut().zip(block.iter()).enumerate() {
                            *dst = (first + step * i as Sample) * x;
                        }
                    }
                }
            }
            accumulate = true;
        }

        if !accumulate {
            row.fill(Complex::new(0.0, 0.0));
        }
    }
}

// ============ ring transform ============

/// Inverse real FFT of one sample instant: modes onto the loudspeaker
/// ring.
pub struct FftSlice {
    index: usize,
    accumulators: Vec<Arc<ModeAccumulator>>,
    ifft: Arc<dyn ComplexToReal<Sample>>,
    spectrum: RtCell<Vec<Complex<Sample>>>,
    row: RtCell<Vec<Sample>>,
    even_ring: bool,
}

impl FftSlice {
    fn row(&self) -> &[Sample] {
        unsafe { self.row.get_ref() }
    }
}

impl Processable for FftSlice {
    fn process(&self) {
        let spectrum = unsafe { self.spectrum.get() };
        let row = unsafe { self.row.get() };

        for (bin, accumulator) in spectrum.iter_mut().zip(&self.accumulators) {
            *bin = accumulator.row()[self.index];
        }
        // DC is real; on even rings the highest mode lands on the Nyquist
        // bin, which is real as well.
        spectrum[0].im = 0.0;
        if self.even_ring {
            if let Some(last) = spectrum.last_mut() {
                last.im = 0.0;
            }
        }

        // Synthesis is the Hermitian expansion of the mode spectrum; no
        // normalization wanted.
        self.ifft.process(spectrum, row).ok();
    }
}

// ============ output ============

/// One loudspeaker of the ring: copies its column out of the transformed
/// slices.
pub struct HoaOutput {
    base: OutputBase,
    channel_index: usize,
    slices: Vec<Arc<FftSlice>>,
}

impl RenderOutput for HoaOutput {
    fn base(&self) -> &OutputBase {
        &self.base
    }
}

impl Processable for HoaOutput {
    fn process(&self) {
        let buffer = self.base.buffer();
        for (sample, slice) in buffer.iter_mut().zip(&self.slices) {
            *sample = slice.row()[self.channel_index];
        }
        self.base.update_level(buffer);
    }
}
