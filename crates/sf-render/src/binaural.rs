//! Binaural renderer
//!
//! Per source: pick the HRIR pair for the listener-relative azimuth and
//! drive one dynamic-filter convolver per ear.  Sources close to the head
//! are blended toward a neutral filter (a dirac at the frontal HRIR's peak
//! position) so the rendering collapses gracefully onto the listener.

use std::sync::Arc;

use sf_core::{math, Params, Sample, SourceModel};
use sf_dsp::combine::{ChannelCombiner, Contribution, CrossfadeMode, RaisedCosineFade};
use sf_dsp::conv::{self, min_partitions, Partitions};
use sf_rt::{AudioBackend, NullBackend, Processable, RtCell};

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::base::{
    ChannelList, OutputBase, RenderOutput, RenderSource, RendererBase, SourceBase,
};
use crate::{load_wav, IrData, RenderError, RenderResult};

/// Prepared HRIR database.
struct HrirSet {
    /// Partitioned spectra, left/right interleaved, one pair per azimuth
    /// step
    filters: Vec<Partitions>,
    /// Dirac at the frontal peak position, for the near-head blend
    neutral: Partitions,
    partitions: usize,
    /// Number of azimuth steps in the set
    angles: usize,
}

/// Binaural renderer: any number of sources into one headphone pair.
pub struct BinauralRenderer {
    base: RendererBase<BinauralSource, BinauralOutput>,
    fade: Arc<RaisedCosineFade>,
    hrirs: Option<Arc<HrirSet>>,
    channels: Mutex<HashMap<u32, Vec<Arc<BinauralChannel>>>>,
}

impl BinauralRenderer {
    pub fn new(params: &Params) -> RenderResult<Self> {
        Self::with_backend(params, Box::new(NullBackend))
    }

    pub fn with_backend(params: &Params, backend: Box<dyn AudioBackend>) -> RenderResult<Self> {
        let base = RendererBase::new(params, backend)?;
        let fade = Arc::new(RaisedCosineFade::new(base.block_size()));
        Ok(Self {
            base,
            fade,
            hrirs: None,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Load the HRIR file named by `hrir_file` (truncated to `hrir_size`
    /// samples if nonzero) and create the two headphone outputs.
    pub fn load_reproduction_setup(&mut self, params: &Params) -> RenderResult<()> {
        let file = params.require_str("hrir_file")?;
        let mut ir = load_wav(file)?;
        ir.truncate(params.get_or("hrir_size", 0usize)?);
        self.load_hrirs(&ir)
    }

    /// Install HRIRs from already loaded data and create the two
    /// headphone outputs.
    pub fn load_hrirs(&mut self, ir: &IrData) -> RenderResult<()> {
        ir.check_sample_rate(self.base.sample_rate())?;
        if ir.channel_count() == 0 || ir.channel_count() % 2 != 0 {
            return Err(RenderError::UnsupportedSetup(format!(
                "number of channels in the HRIR set must be a multiple of 2, got {}",
                ir.channel_count()
            )));
        }

        let block_size = self.base.block_size();
        let partitions = min_partitions(block_size, ir.frames()).max(1);

        let mut transform = conv::Transform::new(block_size)?;
        let filters = ir
            .channels
            .iter()
            .map(|channel| transform.prepare_partitions(channel, partitions))
            .collect();

        // Neutral filter: dirac at the position of the absolute maximum of
        // the first channel (frontal direction, left ear).
        let frontal = &ir.channels[0];
        let peak = frontal
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut impulse = vec![0.0; peak + 1];
        impulse[peak] = 1.0;
        let neutral = Partitions::from_time_domain(block_size, &impulse)?;

        self.hrirs = Some(Arc::new(HrirSet {
            filters,
            neutral,
            partitions,
            angles: ir.channel_count() / 2,
        }));

        for _ in 0..2 {
            let output = Arc::new(BinauralOutput::new(block_size, &self.fade));
            self.base.add_output(output);
        }
        Ok(())
    }

    /// Create a new source; returns its id.
    pub fn add_source(&self) -> RenderResult<u32> {
        let hrirs = Arc::clone(self.hrirs.as_ref().ok_or(RenderError::NoSetup)?);
        let block_size = self.base.block_size();
        let correction = self.base.master_volume_correction();
        let scene = Arc::clone(&self.base.state);

        let mut made_channels = Vec::new();
        let id = self.base.add_source_with(|params, input| {
            let conv_input = Arc::new(RtCell::new(conv::Input::new(
                block_size,
                hrirs.partitions,
            )?));

            let channels: Vec<Arc<BinauralChannel>> = (0..2)
                .map(|_| BinauralChannel::new(&conv_input, block_size, hrirs.partitions))
                .collect::<RenderResult<_>>()?;
            made_channels = channels.clone();

            Ok(Arc::new(BinauralSource {
                base: SourceBase::new(params, input, scene, correction),
                conv_input,
                channels,
                hrirs: Arc::clone(&hrirs),
                state: RtCell::new(SourceGeometry::default()),
            }))
        })?;

        for (output, channel) in self.base.outputs().iter().zip(&made_channels) {
            self.base
                .add_to_sublist(output, BinauralOutput::channel_list, Arc::clone(channel));
        }
        self.channels.lock().insert(id, made_channels);
        Ok(id)
    }

    /// Remove a source; its resources are disposed of on the non-realtime
    /// side.
    pub fn rem_source(&self, id: u32) -> RenderResult<()> {
        let channels = self
            .channels
            .lock()
            .remove(&id)
            .ok_or(RenderError::UnknownSource(id))?;
        for (output, channel) in self.base.outputs().iter().zip(&channels) {
            self.base
                .rem_from_sublist(output, BinauralOutput::channel_list, channel);
        }
        self.base.remove_source(id)
    }

    pub fn rem_all_sources(&self) -> RenderResult<()> {
        for id in self.base.source_ids() {
            self.rem_source(id)?;
        }
        Ok(())
    }

    /// One audio period, driven by the host.
    pub fn audio_callback(
        &self,
        frames: usize,
        inputs: &[&[Sample]],
        outputs: &mut [&mut [Sample]],
    ) -> RenderResult<()> {
        self.base.audio_callback_with(frames, inputs, outputs, |base| {
            base.process_source_list();
            base.process_output_list();
        })
    }
}

impl std::ops::Deref for BinauralRenderer {
    type Target = RendererBase<BinauralSource, BinauralOutput>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl std::ops::DerefMut for BinauralRenderer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

// ============ source ============

struct SourceGeometry {
    hrir_index: usize,
    old_hrir_index: usize,
    /// Blend toward the neutral filter (0 = pure HRIR)
    interp: Sample,
    old_interp: Sample,
    weight: Sample,
    old_weight: Sample,
}

impl Default for SourceGeometry {
    fn default() -> Self {
        // Impossible index/blend values force a filter update in the
        // first cycle.
        Self {
            hrir_index: usize::MAX,
            old_hrir_index: usize::MAX,
            interp: -1.0,
            old_interp: -1.0,
            weight: 0.0,
            old_weight: 0.0,
        }
    }
}

/// Per-source processing: convolver input feed, HRIR selection, distance
/// model.
pub struct BinauralSource {
    base: SourceBase,
    conv_input: Arc<RtCell<conv::Input>>,
    channels: Vec<Arc<BinauralChannel>>,
    hrirs: Arc<HrirSet>,
    state: RtCell<SourceGeometry>,
}

impl RenderSource for BinauralSource {
    fn base(&self) -> &SourceBase {
        &self.base
    }
}

impl Processable for BinauralSource {
    fn process(&self) {
        let st = unsafe { self.state.get() };
        st.old_hrir_index = st.hrir_index;
        st.old_interp = st.interp;
        st.old_weight = st.weight;
        st.interp = 0.0;

        unsafe { self.conv_input.get() }.add_block(self.base.input.samples());

        let (_, weighting) = self.base.process_weight();
        let scene = self.base.scene();
        let (ref_pos, ref_ori) = scene.reference();
        let position = *self.base.params.position.read();

        st.weight = if weighting != 0.0 {
            let mut weight = 1.0;
            match *self.base.params.model.read() {
                SourceModel::Plane => {
                    // No distance attenuation for plane waves, only the
                    // 1/r factor at the amplitude reference distance.
                    weight *= 0.5 / *scene.amplitude_reference_distance.read();
                }
                SourceModel::Point => {
                    let mut distance = (position - ref_pos).length();
                    if distance < 0.5 {
                        st.interp = 1.0 - 2.0 * distance;
                    }
                    // No volume increase for sources closer than 0.5 m.
                    distance = distance.max(0.5);
                    weight *= 0.5 / distance;
                }
            }
            weight * weighting
        } else {
            0.0
        };

        let angles = self.hrirs.angles as Sample;
        let relative = (position - ref_pos).orientation() - ref_ori;
        st.hrir_index = math::wrap(relative.azimuth * angles / 360.0 + 0.5, angles) as usize;

        // Filters are always changed in parallel; checking one channel is
        // enough.
        let queues_empty = unsafe { self.channels[0].filter.get_ref() }.queues_empty();
        let hrir_changed = st.hrir_index != st.old_hrir_index || st.interp != st.old_interp;

        let mode = if st.weight == 0.0 && st.old_weight == 0.0 {
            CrossfadeMode::Nothing
        } else if queues_empty && st.weight == st.old_weight && !hrir_changed {
            CrossfadeMode::Constant
        } else if st.weight == 0.0 {
            CrossfadeMode::FadeOut
        } else if st.old_weight == 0.0 {
            CrossfadeMode::FadeIn
        } else {
            CrossfadeMode::Change
        };

        for (i, channel) in self.channels.iter().enumerate() {
            if mode != CrossfadeMode::Nothing && mode != CrossfadeMode::FadeIn {
                channel.convolve_with(st.old_weight);
            }
            if !queues_empty {
                unsafe { channel.filter.get() }.rotate_queues();
            }

            if hrir_changed {
                let hrir = &self.hrirs.filters[2 * st.hrir_index + i];
                let filter = unsafe { channel.filter.get() };
                if st.interp == 0.0 {
                    filter.set_filter_partitions(hrir);
                } else {
                    // Blend toward the neutral dirac for sources inside
                    // the head radius.
                    let temp = unsafe { channel.temp.get() };
                    temp.interpolate_from(hrir, &self.hrirs.neutral, st.interp);
                    filter.set_filter_partitions(temp);
                }
            }

            *unsafe { channel.mode.get() } = mode;
            *unsafe { channel.weight.get() } = st.weight;
        }
    }
}

// ============ source channel ============

/// The contribution of one source to one ear.
pub struct BinauralChannel {
    input: Arc<RtCell<conv::Input>>,
    filter: RtCell<conv::Filter>,
    output: RtCell<conv::Output>,
    temp: RtCell<Partitions>,
    weight: RtCell<Sample>,
    mode: RtCell<CrossfadeMode>,
}

impl BinauralChannel {
    fn new(
        input: &Arc<RtCell<conv::Input>>,
        block_size: usize,
        partitions: usize,
    ) -> RenderResult<Arc<Self>> {
        let output = conv::Output::new(unsafe { input.get_ref() });
        Ok(Arc::new(Self {
            input: Arc::clone(input),
            filter: RtCell::new(conv::Filter::new(block_size, partitions)?),
            output: RtCell::new(output),
            temp: RtCell::new(Partitions::silence(block_size, partitions)?),
            weight: RtCell::new(0.0),
            mode: RtCell::new(CrossfadeMode::Nothing),
        }))
    }

    fn convolve_with(&self, weight: Sample) {
        let input = unsafe { self.input.get_ref() };
        let filter = unsafe { self.filter.get_ref() };
        unsafe { self.output.get() }.convolve(input, filter, weight);
    }
}

impl Contribution for BinauralChannel {
    fn select(&self) -> CrossfadeMode {
        *unsafe { self.mode.get_ref() }
    }

    fn block(&self) -> &[Sample] {
        unsafe { self.output.get_ref() }.last_block()
    }

    fn update(&self) {
        self.convolve_with(*unsafe { self.weight.get_ref() });
    }
}

// ============ output ============

/// One headphone channel.
pub struct BinauralOutput {
    base: OutputBase,
    channels: ChannelList<BinauralChannel>,
    combiner: RtCell<ChannelCombiner>,
}

impl BinauralOutput {
    fn new(block_size: usize, fade: &Arc<RaisedCosineFade>) -> Self {
        Self {
            base: OutputBase::new(block_size),
            channels: ChannelList::default(),
            combiner: RtCell::new(ChannelCombiner::new(Arc::clone(fade))),
        }
    }

    fn channel_list(&self) -> &ChannelList<BinauralChannel> {
        &self.channels
    }
}

impl RenderOutput for BinauralOutput {
    fn base(&self) -> &OutputBase {
        &self.base
    }
}

impl Processable for BinauralOutput {
    fn process(&self) {
        let channels = unsafe { self.channels.get_ref() };
        let combiner = unsafe { self.combiner.get() };
        let buffer = self.base.buffer();
        combiner.process(channels.iter().map(|c| c.as_ref()), buffer);
        self.base.update_level(buffer);
    }
}
