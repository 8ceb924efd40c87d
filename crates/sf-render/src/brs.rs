//! Binaural room synthesis (BRS) renderer
//!
//! Every source carries its own set of binaural room impulse responses,
//! one pair per listener orientation.  Head tracking switches the filter
//! pair; source positions are not evaluated at all, the BRIRs already
//! contain the room and the source placement.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use sf_core::{math, Params, Sample};
use sf_dsp::combine::{ChannelCombiner, Contribution, CrossfadeMode, RaisedCosineFade};
use sf_dsp::conv::{self, min_partitions, Partitions};
use sf_rt::{AudioBackend, NullBackend, Processable, RtCell};

use crate::base::{
    ChannelList, OutputBase, RenderOutput, RenderSource, RendererBase, SourceBase,
};
use crate::{load_wav, IrData, RenderError, RenderResult};

/// Binaural room synthesis renderer.
pub struct BrsRenderer {
    base: RendererBase<BrsSource, BrsOutput>,
    fade: Arc<RaisedCosineFade>,
    channels: Mutex<HashMap<u32, Vec<Arc<BrsChannel>>>>,
}

impl BrsRenderer {
    pub fn new(params: &Params) -> RenderResult<Self> {
        Self::with_backend(params, Box::new(NullBackend))
    }

    pub fn with_backend(params: &Params, backend: Box<dyn AudioBackend>) -> RenderResult<Self> {
        let base = RendererBase::new(params, backend)?;
        let fade = Arc::new(RaisedCosineFade::new(base.block_size()));
        Ok(Self {
            base,
            fade,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Create the two headphone outputs.
    pub fn load_reproduction_setup(&mut self) -> RenderResult<()> {
        let block_size = self.base.block_size();
        for _ in 0..2 {
            let output = Arc::new(BrsOutput::new(block_size, &self.fade));
            self.base.add_output(output);
        }
        Ok(())
    }

    /// Create a source from a BRIR file (left/right interleaved, one pair
    /// per orientation step).
    pub fn add_source_from_file(&self, path: &str) -> RenderResult<u32> {
        let ir = load_wav(path)?;
        self.add_source(&ir)
    }

    /// Create a source from already loaded BRIR data.
    pub fn add_source(&self, ir: &IrData) -> RenderResult<u32> {
        if self.base.output_count() != 2 {
            return Err(RenderError::NoSetup);
        }
        ir.check_sample_rate(self.base.sample_rate())?;
        if ir.channel_count() == 0 || ir.channel_count() % 2 != 0 {
            return Err(RenderError::UnsupportedSetup(format!(
                "number of channels in a BRIR set must be a multiple of 2, got {}",
                ir.channel_count()
            )));
        }

        let block_size = self.base.block_size();
        let partitions = min_partitions(block_size, ir.frames()).max(1);

        let mut transform = conv::Transform::new(block_size)?;
        let filters: Vec<Partitions> = ir
            .channels
            .iter()
            .map(|channel| transform.prepare_partitions(channel, partitions))
            .collect();
        let brirs = Arc::new(BrirSet {
            angles: ir.channel_count() / 2,
            filters,
        });

        let correction = self.base.master_volume_correction();
        let scene = Arc::clone(&self.base.state);

        let mut made_channels = Vec::new();
        let id = self.base.add_source_with(|params, input| {
            let conv_input = Arc::new(RtCell::new(conv::Input::new(block_size, partitions)?));

            let channels: Vec<Arc<BrsChannel>> = (0..2)
                .map(|_| BrsChannel::new(&conv_input, block_size, partitions))
                .collect::<RenderResult<_>>()?;
            made_channels = channels.clone();

            Ok(Arc::new(BrsSource {
                base: SourceBase::new(params, input, scene, correction),
                conv_input,
                channels,
                brirs,
                state: RtCell::new(BrsState::default()),
            }))
        })?;

        for (output, channel) in self.base.outputs().iter().zip(&made_channels) {
            self.base
                .add_to_sublist(output, BrsOutput::channel_list, Arc::clone(channel));
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
                .rem_from_sublist(output, BrsOutput::channel_list, channel);
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

impl std::ops::Deref for BrsRenderer {
    type Target = RendererBase<BrsSource, BrsOutput>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl std::ops::DerefMut for BrsRenderer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

// ============ source ============

struct BrirSet {
    angles: usize,
    /// left/right interleaved, one pair per orientation step
    filters: Vec<Partitions>,
}

struct BrsState {
    brir_index: usize,
    old_brir_index: usize,
    weight: Sample,
    old_weight: Sample,
}

impl Default for BrsState {
    fn default() -> Self {
        // The impossible index forces a filter update in the first cycle.
        Self {
            brir_index: usize::MAX,
            old_brir_index: usize::MAX,
            weight: 0.0,
            old_weight: 0.0,
        }
    }
}

/// Per-source processing: convolver feed and orientation-driven filter
/// switching.
pub struct BrsSource {
    base: SourceBase,
    conv_input: Arc<RtCell<conv::Input>>,
    channels: Vec<Arc<BrsChannel>>,
    brirs: Arc<BrirSet>,
    state: RtCell<BrsState>,
}

impl RenderSource for BrsSource {
    fn base(&self) -> &SourceBase {
        &self.base
    }
}

impl Processable for BrsSource {
    fn process(&self) {
        let st = unsafe { self.state.get() };
        st.old_brir_index = st.brir_index;
        st.old_weight = st.weight;

        unsafe { self.conv_input.get() }.add_block(self.base.input.samples());

        let (_, weighting) = self.base.process_weight();
        st.weight = weighting;

        // BRIR index from the listener orientation only; 90 degrees is in
        // the middle of index 0.
        let azimuth = self.base.scene().reference_orientation.read().azimuth;
        let angles = self.brirs.angles as Sample;
        st.brir_index =
            math::wrap((azimuth - 90.0) * angles / 360.0 + 0.5, angles) as usize;

        let queues_empty = unsafe { self.channels[0].filter.get_ref() }.queues_empty();
        let brir_changed = st.brir_index != st.old_brir_index;

        let mode = if st.weight == 0.0 && st.old_weight == 0.0 {
            CrossfadeMode::Nothing
        } else if queues_empty && st.weight == st.old_weight && !brir_changed {
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
            if brir_changed {
                // left and right channels are interleaved
                let filter = &self.brirs.filters[2 * st.brir_index + i];
                unsafe { channel.filter.get() }.set_filter_partitions(filter);
            }

            *unsafe { channel.mode.get() } = mode;
            *unsafe { channel.weight.get() } = st.weight;
        }
    }
}

// ============ source channel ============

/// The contribution of one source to one ear.
pub struct BrsChannel {
    input: Arc<RtCell<conv::Input>>,
    filter: RtCell<conv::Filter>,
    output: RtCell<conv::Output>,
    weight: RtCell<Sample>,
    mode: RtCell<CrossfadeMode>,
}

impl BrsChannel {
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

impl Contribution for BrsChannel {
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
pub struct BrsOutput {
    base: OutputBase,
    channels: ChannelList<BrsChannel>,
    combiner: RtCell<ChannelCombiner>,
}

impl BrsOutput {
    fn new(block_size: usize, fade: &Arc<RaisedCosineFade>) -> Self {
        Self {
            base: OutputBase::new(block_size),
            channels: ChannelList::default(),
            combiner: RtCell::new(ChannelCombiner::new(Arc::clone(fade))),
        }
    }

    fn channel_list(&self) -> &ChannelList<BrsChannel> {
        &self.channels
    }
}

impl RenderOutput for BrsOutput {
    fn base(&self) -> &OutputBase {
        &self.base
    }
}

impl Processable for BrsOutput {
    fn process(&self) {
        let channels = unsafe { self.channels.get_ref() };
        let combiner = unsafe { self.combiner.get() };
        let buffer = self.base.buffer();
        combiner.process(channels.iter().map(|c| c.as_ref()), buffer);
        self.base.update_level(buffer);
    }
}
