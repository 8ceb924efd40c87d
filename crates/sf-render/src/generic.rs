//! Generic renderer
//!
//! Every source carries a static matrix of FIR filters, one per
//! loudspeaker; rendering is plain multichannel convolution.  Useful for
//! measured loudspeaker-setup responses and as a reference algorithm.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use sf_core::{Params, Sample};
use sf_dsp::combine::{ChannelCombiner, Contribution, CrossfadeMode, RaisedCosineFade};
use sf_dsp::conv::{Partitions, StaticConvolver};
use sf_rt::{AudioBackend, NullBackend, Processable, RtCell};

use crate::base::{
    ChannelList, OutputBase, RenderOutput, RenderSource, RendererBase, SourceBase,
};
use crate::{load_wav, IrData, LoudspeakerSetup, RenderError, RenderResult};

/// Generic matrix-of-FIRs renderer.
pub struct GenericRenderer {
    base: RendererBase<GenericSource, GenericOutput>,
    fade: Arc<RaisedCosineFade>,
    channels: Mutex<HashMap<u32, Vec<Arc<GenericChannel>>>>,
}

impl GenericRenderer {
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

    /// Create one output per loudspeaker; only the channel count of the
    /// setup matters for this renderer.
    pub fn load_reproduction_setup(&mut self, setup: &LoudspeakerSetup) -> RenderResult<()> {
        let block_size = self.base.block_size();
        for _ in &setup.speakers {
            let output = Arc::new(GenericOutput::new(block_size, &self.fade));
            self.base.add_output(output);
        }
        Ok(())
    }

    /// Create a source from a FIR-matrix file; the file must have exactly
    /// one channel per loudspeaker.
    pub fn add_source_from_file(&self, path: &str) -> RenderResult<u32> {
        let ir = load_wav(path)?;
        self.add_source(&ir)
    }

    /// Create a source from already loaded FIR-matrix data.
    pub fn add_source(&self, ir: &IrData) -> RenderResult<u32> {
        let outputs = self.base.output_count();
        if outputs == 0 {
            return Err(RenderError::NoSetup);
        }
        ir.check_sample_rate(self.base.sample_rate())?;
        if ir.channel_count() != outputs {
            return Err(sf_core::ConfigError::ChannelCountMismatch {
                expected: outputs,
                got: ir.channel_count(),
            }
            .into());
        }

        let block_size = self.base.block_size();
        let correction = self.base.master_volume_correction();
        let scene = Arc::clone(&self.base.state);

        let mut made_channels = Vec::new();
        let id = self.base.add_source_with(|params, input| {
            let weights = Arc::new(RtCell::new((0.0, 0.0)));

            let channels: Vec<Arc<GenericChannel>> = ir
                .channels
                .iter()
                .map(|coefficients| {
                    let filter = Arc::new(Partitions::from_time_domain(block_size, coefficients)?);
                    Ok(Arc::new(GenericChannel {
                        convolver: RtCell::new(StaticConvolver::with_partitions(filter)?),
                        weights: Arc::clone(&weights),
                    }))
                })
                .collect::<RenderResult<_>>()?;
            made_channels = channels.clone();

            Ok(Arc::new(GenericSource {
                base: SourceBase::new(params, input, scene, correction),
                weights,
                channels,
            }))
        })?;

        for (output, channel) in self.base.outputs().iter().zip(&made_channels) {
            self.base
                .add_to_sublist(output, GenericOutput::channel_list, Arc::clone(channel));
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
                .rem_from_sublist(output, GenericOutput::channel_list, channel);
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

impl std::ops::Deref for GenericRenderer {
    type Target = RendererBase<GenericSource, GenericOutput>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl std::ops::DerefMut for GenericRenderer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

// ============ source ============

/// Per-source processing: feed all per-loudspeaker convolvers.
pub struct GenericSource {
    base: SourceBase,
    /// (old, new) weighting factor, shared with the channels
    weights: Arc<RtCell<(Sample, Sample)>>,
    channels: Vec<Arc<GenericChannel>>,
}

impl RenderSource for GenericSource {
    fn base(&self) -> &SourceBase {
        &self.base
    }
}

impl Processable for GenericSource {
    fn process(&self) {
        *unsafe { self.weights.get() } = self.base.process_weight();

        let block = self.base.input.samples();
        for channel in &self.channels {
            unsafe { channel.convolver.get() }.add_block(block);
        }
    }
}

// ============ source channel ============

/// The contribution of one source to one loudspeaker.
pub struct GenericChannel {
    convolver: RtCell<StaticConvolver>,
    weights: Arc<RtCell<(Sample, Sample)>>,
}

impl Contribution for GenericChannel {
    fn select(&self) -> CrossfadeMode {
        let (old, new) = *unsafe { self.weights.get_ref() };

        let mode = if old == 0.0 && new == 0.0 {
            CrossfadeMode::Nothing
        } else if old == new {
            CrossfadeMode::Constant
        } else if old == 0.0 {
            CrossfadeMode::FadeIn
        } else if new == 0.0 {
            CrossfadeMode::FadeOut
        } else {
            CrossfadeMode::Change
        };

        if mode != CrossfadeMode::Nothing && mode != CrossfadeMode::FadeIn {
            unsafe { self.convolver.get() }.convolve(old);
        }
        mode
    }

    fn block(&self) -> &[Sample] {
        unsafe { self.convolver.get_ref() }.last_block()
    }

    fn update(&self) {
        let (_, new) = *unsafe { self.weights.get_ref() };
        unsafe { self.convolver.get() }.convolve(new);
    }
}

// ============ output ============

/// One loudspeaker channel.
pub struct GenericOutput {
    base: OutputBase,
    channels: ChannelList<GenericChannel>,
    combiner: RtCell<ChannelCombiner>,
}

impl GenericOutput {
    fn new(block_size: usize, fade: &Arc<RaisedCosineFade>) -> Self {
        Self {
            base: OutputBase::new(block_size),
            channels: ChannelList::default(),
            combiner: RtCell::new(ChannelCombiner::new(Arc::clone(fade))),
        }
    }

    fn channel_list(&self) -> &ChannelList<GenericChannel> {
        &self.channels
    }
}

impl RenderOutput for GenericOutput {
    fn base(&self) -> &OutputBase {
        &self.base
    }
}

impl Processable for GenericOutput {
    fn process(&self) {
        let channels = unsafe { self.channels.get_ref() };
        let combiner = unsafe { self.combiner.get() };
        let buffer = self.base.buffer();
        combiner.process(channels.iter().map(|c| c.as_ref()), buffer);
        self.base.update_level(buffer);
    }
}
