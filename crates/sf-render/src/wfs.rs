//! Wave-field synthesis renderer
//!
//! Every source writes its pre-filtered signal into a non-causal block
//! delay line once per period; every loudspeaker then reads that line at
//! its own geometric delay, weighted by loudspeaker selection, distance
//! attenuation and tapering.  Focused sources (between the listener and
//! the array) invert delay and selection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use sf_core::{
    angle, math, DirectionalPoint, Params, Sample, SourceModel, SPEED_OF_SOUND,
};
use sf_dsp::combine::{ChannelCombiner, Contribution, CrossfadeMode, RaisedCosineFade};
use sf_dsp::conv::{Partitions, StaticConvolver};
use sf_dsp::delayline::NonCausalBlockDelayLine;
use sf_rt::{AudioBackend, NullBackend, Processable, RtCell, RtList};

use crate::base::{
    ChannelList, OutputBase, RenderOutput, RenderSource, RendererBase, SceneState, SourceBase,
    SourceParams,
};
use crate::{
    load_wav, Loudspeaker, LoudspeakerModel, LoudspeakerSetup, RenderError, RenderResult,
};

/// Restricted area around a loudspeaker to avoid division by zero (1 cm).
const SAFETY_RADIUS: Sample = 0.01;

/// Wave-field synthesis renderer.
pub struct WfsRenderer {
    base: RendererBase<WfsSource, WfsOutput>,
    fade: Arc<RaisedCosineFade>,
    prefilter: Option<Arc<Partitions>>,
    max_delay: usize,
    initial_delay: usize,
    channels: Mutex<HashMap<u32, Vec<Arc<WfsChannel>>>>,
}

impl WfsRenderer {
    pub fn new(params: &Params) -> RenderResult<Self> {
        Self::with_backend(params, Box::new(NullBackend))
    }

    pub fn with_backend(params: &Params, backend: Box<dyn AudioBackend>) -> RenderResult<Self> {
        let base = RendererBase::new(params, backend)?;
        let fade = Arc::new(RaisedCosineFade::new(base.block_size()));

        // Default to one second of history if the configuration does not
        // size the delay line.
        let max_delay = params.get_or("delayline_size", base.sample_rate() as usize)?;
        let initial_delay = params.get_or("initial_delay", 0usize)?;

        let mut renderer = Self {
            base,
            fade,
            prefilter: None,
            max_delay,
            initial_delay,
            channels: Mutex::new(HashMap::new()),
        };

        if let Some(path) = params.get_str("prefilter_file") {
            let path = path.to_string();
            renderer.load_prefilter_file(&path)?;
        }
        Ok(renderer)
    }

    /// Load the WFS pre-equalization filter from a single-channel file.
    pub fn load_prefilter_file(&mut self, path: &str) -> RenderResult<()> {
        let ir = load_wav(path)?;
        ir.check_sample_rate(self.base.sample_rate())?;
        if ir.channel_count() != 1 {
            return Err(RenderError::UnsupportedSetup(format!(
                "WFS pre-filter must have exactly one channel, {path:?} has {}",
                ir.channel_count()
            )));
        }
        self.set_prefilter(&ir.channels[0])
    }

    /// Install the pre-equalization filter from raw coefficients.
    pub fn set_prefilter(&mut self, ir: &[Sample]) -> RenderResult<()> {
        self.prefilter = Some(Arc::new(Partitions::from_time_domain(
            self.base.block_size(),
            ir,
        )?));
        Ok(())
    }

    /// Create one output item per loudspeaker.  Requires the pre-filter.
    pub fn load_reproduction_setup(&mut self, setup: &LoudspeakerSetup) -> RenderResult<()> {
        if self.prefilter.is_none() {
            return Err(RenderError::UnsupportedSetup(
                "no WFS pre-filter loaded".to_string(),
            ));
        }
        let block_size = self.base.block_size();
        let sample_rate = self.base.sample_rate();
        let scene = Arc::clone(&self.base.state);
        for speaker in &setup.speakers {
            let output = Arc::new(WfsOutput {
                base: OutputBase::new(block_size),
                speaker: *speaker,
                scene: Arc::clone(&scene),
                sample_rate,
                channels: ChannelList::default(),
                combiner: RtCell::new(ChannelCombiner::new(Arc::clone(&self.fade))),
            });
            self.base.add_output(output);
        }
        Ok(())
    }

    pub fn add_source(&self) -> RenderResult<u32> {
        let prefilter = Arc::clone(self.prefilter.as_ref().ok_or(RenderError::NoSetup)?);
        if self.base.output_count() == 0 {
            return Err(RenderError::NoSetup);
        }

        let block_size = self.base.block_size();
        let correction = self.base.master_volume_correction();
        let scene = Arc::clone(&self.base.state);
        let output_list = Arc::clone(self.base.output_list());
        let output_count = self.base.output_count();
        let (max_delay, initial_delay) = (self.max_delay, self.initial_delay);

        let mut made_channels = Vec::new();
        let id = self.base.add_source_with(|params, input| {
            let shared = Arc::new(WfsShared {
                params: Arc::clone(&params),
                delayline: RtCell::new(NonCausalBlockDelayLine::new(
                    block_size,
                    max_delay,
                    initial_delay,
                )),
                weight: RtCell::new(0.0),
                focused: RtCell::new(false),
            });

            let channels: Vec<Arc<WfsChannel>> = (0..output_count)
                .map(|_| {
                    Arc::new(WfsChannel {
                        shared: Arc::clone(&shared),
                        state: RtCell::new(WfsChannelState::default()),
                        scratch: RtCell::new(vec![0.0; block_size]),
                    })
                })
                .collect();
            made_channels = channels.clone();

            Ok(Arc::new(WfsSource {
                base: SourceBase::new(params, input, scene, correction),
                prefilter: RtCell::new(StaticConvolver::with_partitions(prefilter)?),
                shared,
                outputs: output_list,
            }))
        })?;

        for (output, channel) in self.base.outputs().iter().zip(&made_channels) {
            self.base
                .add_to_sublist(output, WfsOutput::channel_list, Arc::clone(channel));
        }
        self.channels.lock().insert(id, made_channels);
        Ok(id)
    }

    pub fn rem_source(&self, id: u32) -> RenderResult<()> {
        let channels = self
            .channels
            .lock()
            .remove(&id)
            .ok_or(RenderError::UnknownSource(id))?;
        for (output, channel) in self.base.outputs().iter().zip(&channels) {
            self.base
                .rem_from_sublist(output, WfsOutput::channel_list, channel);
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
            base.process_output_list();
        })
    }
}

impl std::ops::Deref for WfsRenderer {
    type Target = RendererBase<WfsSource, WfsOutput>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl std::ops::DerefMut for WfsRenderer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

// ============ per-source shared state ============

/// State shared between a source item and its per-loudspeaker channels.
struct WfsShared {
    params: Arc<SourceParams>,
    delayline: RtCell<NonCausalBlockDelayLine>,
    /// Weighting factor of the current block
    weight: RtCell<Sample>,
    focused: RtCell<bool>,
}

// ============ source ============

/// Per-source processing: pre-filtering, delay-line feed and focused-source
/// detection.
pub struct WfsSource {
    base: SourceBase,
    prefilter: RtCell<StaticConvolver>,
    shared: Arc<WfsShared>,
    outputs: Arc<RtList<Arc<WfsOutput>>>,
}

impl RenderSource for WfsSource {
    fn base(&self) -> &SourceBase {
        &self.base
    }
}

impl Processable for WfsSource {
    fn process(&self) {
        let (_, weighting) = self.base.process_weight();
        *unsafe { self.shared.weight.get() } = weighting;

        // Pre-filter once per source, then feed the delay line.
        let convolver = unsafe { self.prefilter.get() };
        convolver.add_block(self.base.input.samples());
        let filtered = convolver.convolve(1.0);
        unsafe { self.shared.delayline.get() }.write_block(filtered);

        // A point source is "focused" when every loudspeaker turns its
        // back to it; one loudspeaker facing the source makes it ordinary.
        let focused = match *self.base.params.model.read() {
            SourceModel::Plane => false,
            SourceModel::Point => {
                let scene = self.base.scene();
                let reference = DirectionalPoint::new(
                    *scene.reference_position.read(),
                    *scene.reference_orientation.read(),
                );
                let position = *self.base.params.position.read();

                let mut focused = true;
                self.outputs.for_each(|output| {
                    if !focused || output.speaker.model == LoudspeakerModel::Subwoofer {
                        return;
                    }
                    let speaker = output.speaker.point.transform(&reference);
                    let a = math::wrap(
                        angle(speaker.position - position, speaker.orientation),
                        std::f32::consts::TAU,
                    );
                    if a < std::f32::consts::FRAC_PI_2 || a > 1.5 * std::f32::consts::PI {
                        focused = false;
                    }
                });
                focused
            }
        };
        *unsafe { self.shared.focused.get() } = focused;
    }
}

// ============ source channel ============

#[derive(Default)]
struct WfsChannelState {
    weight: Sample,
    old_weight: Sample,
    delay: i64,
    old_delay: i64,
    mode: CrossfadeMode,
}

/// The contribution of one source to one loudspeaker.
pub struct WfsChannel {
    shared: Arc<WfsShared>,
    state: RtCell<WfsChannelState>,
    scratch: RtCell<Vec<Sample>>,
}

impl Contribution for WfsChannel {
    fn select(&self) -> CrossfadeMode {
        unsafe { self.state.get_ref() }.mode
    }

    fn block(&self) -> &[Sample] {
        unsafe { self.scratch.get_ref() }
    }

    fn update(&self) {
        let st = unsafe { self.state.get_ref() };
        let delayline = unsafe { self.shared.delayline.get_ref() };
        delayline.read_block(st.delay, st.weight, unsafe { self.scratch.get() });
    }
}

// ============ output ============

/// One loudspeaker.
pub struct WfsOutput {
    base: OutputBase,
    pub speaker: Loudspeaker,
    scene: Arc<SceneState>,
    sample_rate: u32,
    channels: ChannelList<WfsChannel>,
    combiner: RtCell<ChannelCombiner>,
}

impl WfsOutput {
    fn channel_list(&self) -> &ChannelList<WfsChannel> {
        &self.channels
    }

    /// Evaluate delay and weight of one contribution for this
    /// loudspeaker, decide its crossfade mode and render the
    /// previous-parameter block where needed.
    fn evaluate(&self, channel: &WfsChannel) {
        let st = unsafe { channel.state.get() };
        st.old_weight = st.weight;
        st.old_delay = st.delay;

        let reference = DirectionalPoint::new(
            *self.scene.reference_position.read(),
            *self.scene.reference_orientation.read(),
        );
        let reference_offset = DirectionalPoint::new(
            *self.scene.reference_offset_position.read(),
            *self.scene.reference_offset_orientation.read(),
        )
        .transform(&reference);

        let speaker = self.speaker.point.transform(&reference);
        let subwoofer = self.speaker.model == LoudspeakerModel::Subwoofer;

        let source_position = *channel.shared.params.position.read();
        let source_orientation = *channel.shared.params.orientation.read();
        let model = *channel.shared.params.model.read();
        let focused = *unsafe { channel.shared.focused.get_ref() };

        let reference_distance = (speaker.position - reference_offset.position).length();

        let mut weight: Sample = 1.0;
        // Delay in meters; negative values reach into the future part of
        // the delay line.
        let mut delay: Sample = 0.0;

        match model {
            SourceModel::Point => {
                if subwoofer {
                    // The delay is calculated to be correct at the
                    // reference position; it can be negative.
                    delay = (source_position - reference_offset.position).length()
                        - reference_distance;
                    weight = 1.0 / delay.abs().max(SAFETY_RADIUS).sqrt();
                } else {
                    delay = (speaker.position - source_position).length();
                    let denominator = delay.max(SAFETY_RADIUS).sqrt();

                    // Loudspeaker selection: the cosine between the
                    // source-to-speaker line and the speaker orientation.
                    weight = angle(speaker.position - source_position, speaker.orientation)
                        .cos()
                        / denominator;

                    if weight < 0.0 {
                        if focused {
                            let lhs = speaker.position - source_position;
                            let rhs = reference_offset.position - source_position;
                            if lhs.dot(&rhs) < 0.0 {
                                // The source lies between this loudspeaker
                                // and the reference: emit the converging
                                // wavefront.
                                delay = -delay;
                                weight = -weight;
                            } else {
                                weight = 0.0;
                            }
                        } else {
                            // Loudspeaker turned away from an ordinary
                            // source.
                            weight = 0.0;
                        }
                    }
                }
            }
            SourceModel::Plane => {
                let wavefront =
                    DirectionalPoint::new(source_position, source_orientation);
                if subwoofer {
                    weight = 1.0;
                    delay = wavefront.plane_to_point_distance(reference_offset.position)
                        - reference_distance;
                } else {
                    // Cosine between wavefront direction and loudspeaker
                    // orientation.
                    weight = math::deg_to_rad(
                        source_orientation.azimuth - speaker.orientation.azimuth,
                    )
                    .cos();
                    if weight < 0.0 {
                        weight = 0.0;
                    } else {
                        delay = wavefront.plane_to_point_distance(speaker.position);
                    }
                }
            }
        }

        // Distance attenuation.
        if model == SourceModel::Plane {
            let amplitude_reference = *self.scene.amplitude_reference_distance.read();
            weight *= 0.5 / amplitude_reference;
        } else {
            let source_distance = (source_position - reference_offset.position)
                .length()
                .max(0.5);
            weight *= 0.5 / source_distance;
        }

        weight *= *unsafe { channel.shared.weight.get_ref() };
        weight *= self.speaker.weight;

        // Delay in samples, rounded.
        let delay_samples = delay / SPEED_OF_SOUND * self.sample_rate as Sample;
        let int_delay = (delay_samples + 0.5) as i64;

        let delayline = unsafe { channel.shared.delayline.get_ref() };
        if delayline.delay_is_valid(int_delay) {
            st.delay = int_delay;
            st.weight = weight;
        } else {
            // Out-of-range delay: this contribution is silent for the
            // block.
            st.delay = 0;
            st.weight = 0.0;
        }

        st.mode = if st.old_weight == 0.0 && st.weight == 0.0 {
            CrossfadeMode::Nothing
        } else if st.old_weight == st.weight && st.old_delay == st.delay {
            CrossfadeMode::Constant
        } else if st.old_weight == 0.0 {
            CrossfadeMode::FadeIn
        } else if st.weight == 0.0 {
            CrossfadeMode::FadeOut
        } else {
            CrossfadeMode::Change
        };

        // Render the previous-parameter block for the modes that read it.
        if matches!(
            st.mode,
            CrossfadeMode::Constant | CrossfadeMode::Change | CrossfadeMode::FadeOut
        ) {
            delayline.read_block(st.old_delay, st.old_weight, unsafe {
                channel.scratch.get()
            });
        }
    }
}

impl RenderOutput for WfsOutput {
    fn base(&self) -> &OutputBase {
        &self.base
    }
}

impl Processable for WfsOutput {
    fn process(&self) {
        let channels = unsafe { self.channels.get_ref() };
        for channel in channels.iter() {
            self.evaluate(channel);
        }

        let combiner = unsafe { self.combiner.get() };
        let buffer = self.base.buffer();
        combiner.process(channels.iter().map(|c| c.as_ref()), buffer);
        self.base.update_level(buffer);
    }
}
