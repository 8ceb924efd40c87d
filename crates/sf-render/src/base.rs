//! Renderer base: graph wiring shared by all rendering algorithms
//!
//! Owns the `MimoProcessor`, the scene state, the three item lists
//! (inputs, sources, outputs) and the source map.  Concrete renderers add
//! their per-algorithm source/output types and drive the list order in
//! their `audio_callback`.

use std::collections::{HashMap, LinkedList};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use portable_atomic::AtomicF32;

use sf_core::{math, Orientation, Params, Position, Sample, SourceModel};
use sf_rt::{
    AudioBackend, Command, CommandQueue, MimoProcessor, Processable, Query, QueryArm, RtCell,
    RtList,
};

use crate::{RenderError, RenderResult};

// ============ scene state ============

/// Scene-wide state, all cells command-backed.
pub struct SceneState {
    pub reference_position: Arc<sf_rt::SharedData<Position>>,
    pub reference_orientation: Arc<sf_rt::SharedData<Orientation>>,
    pub reference_offset_position: Arc<sf_rt::SharedData<Position>>,
    pub reference_offset_orientation: Arc<sf_rt::SharedData<Orientation>>,
    pub master_volume: Arc<sf_rt::SharedData<Sample>>,
    pub processing: Arc<sf_rt::SharedData<bool>>,
    pub amplitude_reference_distance: Arc<sf_rt::SharedData<Sample>>,
}

impl SceneState {
    fn new(queue: &Arc<CommandQueue>) -> Arc<Self> {
        Arc::new(Self {
            reference_position: sf_rt::SharedData::new(Arc::clone(queue), Position::default()),
            reference_orientation: sf_rt::SharedData::new(
                Arc::clone(queue),
                Orientation::default(),
            ),
            reference_offset_position: sf_rt::SharedData::new(
                Arc::clone(queue),
                Position::default(),
            ),
            reference_offset_orientation: sf_rt::SharedData::new(
                Arc::clone(queue),
                Orientation::default(),
            ),
            master_volume: sf_rt::SharedData::new(Arc::clone(queue), 1.0),
            processing: sf_rt::SharedData::new(Arc::clone(queue), true),
            amplitude_reference_distance: sf_rt::SharedData::new(Arc::clone(queue), 3.0),
        })
    }

    /// Reference point including the offset, as seen by the realtime
    /// thread.
    pub fn reference(&self) -> (Position, Orientation) {
        (
            *self.reference_position.read() + *self.reference_offset_position.read(),
            *self.reference_orientation.read() + *self.reference_offset_orientation.read(),
        )
    }
}

// ============ per-source control cells ============

/// Control cells of one source; shared between the control plane and the
/// realtime source item.
pub struct SourceParams {
    pub position: Arc<sf_rt::SharedData<Position>>,
    pub orientation: Arc<sf_rt::SharedData<Orientation>>,
    pub gain: Arc<sf_rt::SharedData<Sample>>,
    pub mute: Arc<sf_rt::SharedData<bool>>,
    pub model: Arc<sf_rt::SharedData<SourceModel>>,
}

impl SourceParams {
    fn new(queue: &Arc<CommandQueue>) -> Arc<Self> {
        Arc::new(Self {
            position: sf_rt::SharedData::new(Arc::clone(queue), Position::default()),
            orientation: sf_rt::SharedData::new(Arc::clone(queue), Orientation::default()),
            gain: sf_rt::SharedData::new(Arc::clone(queue), 1.0),
            mute: sf_rt::SharedData::new(Arc::clone(queue), false),
            model: sf_rt::SharedData::new(Arc::clone(queue), SourceModel::Point),
        })
    }
}

// ============ input items ============

/// One host input channel: fetches the host buffer into an engine-owned
/// block at the top of every period.
pub struct InputItem {
    channel: usize,
    buffer: RtCell<Vec<Sample>>,
    /// Host buffer for the current period; set by the callback before the
    /// input list is processed, cleared afterwards.
    host: RtCell<Option<(*const Sample, usize)>>,
}

// The host pointer is only stored and dereferenced inside one audio
// callback invocation.
unsafe impl Send for InputItem {}
unsafe impl Sync for InputItem {}

impl InputItem {
    fn new(channel: usize, block_size: usize) -> Arc<Self> {
        Arc::new(Self {
            channel,
            buffer: RtCell::new(vec![0.0; block_size]),
            host: RtCell::new(None),
        })
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// The fetched block of the current period (realtime thread).
    pub fn samples(&self) -> &[Sample] {
        unsafe { self.buffer.get_ref() }
    }

    fn set_host(&self, host: Option<&[Sample]>) {
        let slot = unsafe { self.host.get() };
        *slot = host.map(|s| (s.as_ptr(), s.len()));
    }
}

impl Processable for InputItem {
    fn process(&self) {
        let buffer = unsafe { self.buffer.get() };
        match unsafe { self.host.get() }.take() {
            Some((ptr, len)) if len == buffer.len() => {
                let host = unsafe { std::slice::from_raw_parts(ptr, len) };
                buffer.copy_from_slice(host);
            }
            _ => buffer.fill(0.0),
        }
    }
}

// ============ source/output bases ============

/// State embedded in every concrete source item.
pub struct SourceBase {
    pub params: Arc<SourceParams>,
    pub input: Arc<InputItem>,
    scene: Arc<SceneState>,
    correction: Sample,
    id: AtomicU32,
    /// (previous block, current block) weighting factor
    weights: RtCell<(Sample, Sample)>,
    level: AtomicF32,
}

impl SourceBase {
    pub fn new(
        params: Arc<SourceParams>,
        input: Arc<InputItem>,
        scene: Arc<SceneState>,
        correction: Sample,
    ) -> Self {
        Self {
            params,
            input,
            scene,
            correction,
            id: AtomicU32::new(0),
            weights: RtCell::new((0.0, 0.0)),
            level: AtomicF32::new(0.0),
        }
    }

    pub fn scene(&self) -> &SceneState {
        &self.scene
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    /// Pre-fader peak times weighting factor, from the last period.
    pub fn level(&self) -> Sample {
        self.level.load(Ordering::Relaxed)
    }

    /// Advance the weighting factor history for this block and return
    /// (old, new).
    ///
    /// `weighting = gain * master_volume * correction`, gated by the mute
    /// flag and the scene-wide processing switch.
    pub fn process_weight(&self) -> (Sample, Sample) {
        let weights = unsafe { self.weights.get() };
        weights.0 = weights.1;

        weights.1 = if !*self.scene.processing.read() || *self.params.mute.read() {
            0.0
        } else {
            *self.params.gain.read() * *self.scene.master_volume.read() * self.correction
        };

        let peak = math::max_amplitude(self.input.samples());
        self.level.store(peak * weights.1, Ordering::Relaxed);

        (weights.0, weights.1)
    }

    /// The weighting factors of the current period, as computed by
    /// [`process_weight`](Self::process_weight).
    pub fn weights(&self) -> (Sample, Sample) {
        *unsafe { self.weights.get_ref() }
    }
}

/// State embedded in every concrete output item.
pub struct OutputBase {
    buffer: RtCell<Vec<Sample>>,
    level: AtomicF32,
}

impl OutputBase {
    pub fn new(block_size: usize) -> Self {
        Self {
            buffer: RtCell::new(vec![0.0; block_size]),
            level: AtomicF32::new(0.0),
        }
    }

    /// Output accumulation buffer (realtime thread, output phase only).
    #[allow(clippy::mut_from_ref)]
    pub fn buffer(&self) -> &mut Vec<Sample> {
        unsafe { self.buffer.get() }
    }

    pub fn level(&self) -> Sample {
        self.level.load(Ordering::Relaxed)
    }

    /// Store the peak meter for the block just rendered.
    pub fn update_level(&self, block: &[Sample]) {
        self.level.store(math::max_amplitude(block), Ordering::Relaxed);
    }
}

/// Concrete source items expose their embedded base.
pub trait RenderSource: Processable + 'static {
    fn base(&self) -> &SourceBase;
}

/// Concrete output items expose their embedded base.
pub trait RenderOutput: Processable + 'static {
    fn base(&self) -> &OutputBase;
}

// ============ metering / query types ============

struct Meters {
    master_level: AtomicF32,
    cpu_load: AtomicF32,
    frames: AtomicU64,
}

/// Per-period snapshot delivered through the query queue.
#[derive(Debug, Clone, Default)]
pub struct Levels {
    /// Total frames rendered so far
    pub frames: u64,
    /// Fraction of the period spent inside the callback (smoothed)
    pub cpu_load: f32,
    /// Master output peak of the last period
    pub master_level: Sample,
    /// (source id, level) pairs
    pub source_levels: Vec<(u32, Sample)>,
}

struct LevelQuery<S: RenderSource> {
    source_list: Arc<RtList<Arc<S>>>,
    meters: Arc<Meters>,
    snapshot: Levels,
    valid: bool,
    wanted_len: usize,
    consumer: Box<dyn FnMut(&Levels) + Send>,
}

impl<S: RenderSource> Query for LevelQuery<S> {
    fn fetch(&mut self) {
        let count = self.source_list.len();
        if count != self.snapshot.source_levels.len() {
            // A source was added or removed since the last cycle; skip
            // this snapshot and resize during cleanup (no realtime
            // allocation).
            self.valid = false;
            self.wanted_len = count;
            return;
        }

        let mut index = 0;
        let entries = &mut self.snapshot.source_levels;
        self.source_list.for_each(|source| {
            let base = source.base();
            entries[index] = (base.id(), base.level());
            index += 1;
        });

        self.snapshot.frames = self.meters.frames.load(Ordering::Relaxed);
        self.snapshot.cpu_load = self.meters.cpu_load.load(Ordering::Relaxed);
        self.snapshot.master_level = self.meters.master_level.load(Ordering::Relaxed);
        self.valid = true;
    }

    fn deliver(&mut self) {
        if self.valid {
            (self.consumer)(&self.snapshot);
        } else {
            self.snapshot.source_levels.resize(self.wanted_len, (0, 0.0));
        }
    }
}

// ============ sublist commands ============

/// Channel containers of combining items: spliceable without allocation.
pub type ChannelList<C> = RtCell<LinkedList<Arc<C>>>;

struct AddToSublist<T: Send + Sync + 'static, C: Send + Sync + 'static> {
    target: Arc<T>,
    select: fn(&T) -> &ChannelList<C>,
    items: LinkedList<Arc<C>>,
}

impl<T: Send + Sync, C: Send + Sync> Command for AddToSublist<T, C> {
    fn execute(&mut self) {
        let list = unsafe { (self.select)(&self.target).get() };
        list.append(&mut self.items);
    }

    fn cleanup(&mut self) {}
}

struct RemFromSublist<T: Send + Sync + 'static, C: Send + Sync + 'static> {
    target: Arc<T>,
    select: fn(&T) -> &ChannelList<C>,
    victim: usize,
    garbage: LinkedList<Arc<C>>,
}

impl<T: Send + Sync, C: Send + Sync> Command for RemFromSublist<T, C> {
    fn execute(&mut self) {
        let list = unsafe { (self.select)(&self.target).get() };
        if let Some(index) = list
            .iter()
            .position(|c| Arc::as_ptr(c).cast::<()>() as usize == self.victim)
        {
            let mut tail = list.split_off(index);
            if let Some(victim) = tail.pop_front() {
                self.garbage.push_back(victim);
            }
            list.append(&mut tail);
        }
    }

    fn cleanup(&mut self) {
        self.garbage.clear();
    }
}

// ============ renderer base ============

struct SourceEntry {
    params: Arc<SourceParams>,
    source_key: usize,
    input_key: usize,
    input_slot: usize,
}

struct SourceTable {
    next_id: u32,
    entries: HashMap<u32, SourceEntry>,
    /// Host input channel assignment; freed slots are reused
    input_slots: Vec<Option<Arc<InputItem>>>,
}

/// Graph wiring, scene state and metering shared by all renderers.
pub struct RendererBase<S: RenderSource, O: RenderOutput> {
    proc: MimoProcessor,
    pub state: Arc<SceneState>,
    master_volume_correction: Sample,
    input_list: Arc<RtList<Arc<InputItem>>>,
    source_list: Arc<RtList<Arc<S>>>,
    output_list: Arc<RtList<Arc<O>>>,
    /// Output items in host-channel order; fixed once the reproduction
    /// setup is loaded, before activation
    outputs: Vec<Arc<O>>,
    table: Mutex<SourceTable>,
    meters: Arc<Meters>,
}

impl<S: RenderSource, O: RenderOutput> RendererBase<S, O> {
    pub fn new(params: &Params, backend: Box<dyn AudioBackend>) -> RenderResult<Self> {
        let proc = MimoProcessor::new(params, backend)?;
        let fifo = Arc::clone(proc.fifo());

        let correction_db: Sample = params.get_or("master_volume_correction", 0.0)?;

        Ok(Self {
            state: SceneState::new(&fifo),
            master_volume_correction: math::db_to_linear(correction_db),
            input_list: RtList::new(Arc::clone(&fifo)),
            source_list: RtList::new(Arc::clone(&fifo)),
            output_list: RtList::new(Arc::clone(&fifo)),
            outputs: Vec::new(),
            table: Mutex::new(SourceTable {
                next_id: 0,
                entries: HashMap::new(),
                input_slots: Vec::new(),
            }),
            meters: Arc::new(Meters {
                master_level: AtomicF32::new(0.0),
                cpu_load: AtomicF32::new(0.0),
                frames: AtomicU64::new(0),
            }),
            proc,
        })
    }

    pub fn block_size(&self) -> usize {
        self.proc.block_size()
    }

    pub fn sample_rate(&self) -> u32 {
        self.proc.sample_rate()
    }

    pub fn fifo(&self) -> &Arc<CommandQueue> {
        self.proc.fifo()
    }

    pub fn master_volume_correction(&self) -> Sample {
        self.master_volume_correction
    }

    pub fn master_level(&self) -> Sample {
        self.meters.master_level.load(Ordering::Relaxed)
    }

    pub fn source_count(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn outputs(&self) -> &[Arc<O>] {
        &self.outputs
    }

    /// The source list; realtime thread only.
    pub fn source_list(&self) -> &Arc<RtList<Arc<S>>> {
        &self.source_list
    }

    /// The output list; realtime thread only.
    pub fn output_list(&self) -> &Arc<RtList<Arc<O>>> {
        &self.output_list
    }

    // ------------ activation ------------

    pub fn activate(&mut self) -> RenderResult<()> {
        self.proc.activate()?;
        Ok(())
    }

    pub fn deactivate(&mut self) -> RenderResult<()> {
        self.proc.deactivate()?;
        Ok(())
    }

    pub fn wait_for_rt(&self) {
        self.proc.wait_for_rt();
    }

    // ------------ scene control (non-realtime) ------------

    pub fn set_reference_position(&self, position: Position) {
        self.state.reference_position.write(position);
    }

    pub fn set_reference_orientation(&self, orientation: Orientation) {
        self.state.reference_orientation.write(orientation);
    }

    pub fn set_reference_offset_position(&self, position: Position) {
        self.state.reference_offset_position.write(position);
    }

    pub fn set_reference_offset_orientation(&self, orientation: Orientation) {
        self.state.reference_offset_orientation.write(orientation);
    }

    pub fn set_master_volume(&self, volume: Sample) {
        self.state.master_volume.write(volume);
    }

    pub fn set_processing(&self, enabled: bool) {
        self.state.processing.write(enabled);
    }

    pub fn set_amplitude_reference_distance(&self, distance: Sample) {
        self.state.amplitude_reference_distance.write(distance);
    }

    fn with_source<T>(
        &self,
        id: u32,
        f: impl FnOnce(&SourceEntry) -> T,
    ) -> RenderResult<T> {
        let table = self.table.lock();
        table
            .entries
            .get(&id)
            .map(f)
            .ok_or(RenderError::UnknownSource(id))
    }

    pub fn set_source_position(&self, id: u32, position: Position) -> RenderResult<()> {
        self.with_source(id, |e| e.params.position.write(position))
    }

    pub fn set_source_orientation(&self, id: u32, orientation: Orientation) -> RenderResult<()> {
        self.with_source(id, |e| e.params.orientation.write(orientation))
    }

    pub fn set_source_gain(&self, id: u32, gain: Sample) -> RenderResult<()> {
        self.with_source(id, |e| e.params.gain.write(gain))
    }

    pub fn set_source_mute(&self, id: u32, mute: bool) -> RenderResult<()> {
        self.with_source(id, |e| e.params.mute.write(mute))
    }

    pub fn set_source_model(&self, id: u32, model: SourceModel) -> RenderResult<()> {
        self.with_source(id, |e| e.params.model.write(model))
    }

    // ------------ source wiring (non-realtime) ------------

    /// Create the input item and control cells for a new source and build
    /// the source item with `make`; registers everything and returns the
    /// source id.
    pub fn add_source_with(
        &self,
        make: impl FnOnce(Arc<SourceParams>, Arc<InputItem>) -> RenderResult<Arc<S>>,
    ) -> RenderResult<u32> {
        let mut table = self.table.lock();

        let slot = table
            .input_slots
            .iter()
            .position(|s| s.is_none())
            .unwrap_or(table.input_slots.len());
        let input = InputItem::new(slot, self.block_size());
        let params = SourceParams::new(self.proc.fifo());

        let source = make(Arc::clone(&params), Arc::clone(&input))?;

        let input_key = self.input_list.add(Arc::clone(&input));
        let source_key = self.source_list.add(Arc::clone(&source));

        table.next_id += 1;
        let id = table.next_id;
        source.base().id.store(id, Ordering::Relaxed);

        if slot == table.input_slots.len() {
            table.input_slots.push(Some(input));
        } else {
            table.input_slots[slot] = Some(input);
        }
        table.entries.insert(
            id,
            SourceEntry {
                params,
                source_key,
                input_key,
                input_slot: slot,
            },
        );
        Ok(id)
    }

    /// Remove a source from the lists and the map.  The caller must have
    /// disconnected its per-output contributions first (in the same
    /// command-queue order).
    pub fn remove_source(&self, id: u32) -> RenderResult<()> {
        let mut table = self.table.lock();
        let entry = table
            .entries
            .remove(&id)
            .ok_or(RenderError::UnknownSource(id))?;

        self.source_list.rem(entry.source_key);
        self.input_list.rem(entry.input_key);
        table.input_slots[entry.input_slot] = None;
        Ok(())
    }

    /// Ids of all sources, for bulk removal.
    pub fn source_ids(&self) -> Vec<u32> {
        self.table.lock().entries.keys().copied().collect()
    }

    /// Register an output item.  Only allowed while the reproduction setup
    /// is being loaded, before activation.
    pub fn add_output(&mut self, output: Arc<O>) {
        self.output_list.add(Arc::clone(&output));
        self.outputs.push(output);
    }

    /// Splice a contribution into the channel list of a combining item
    /// (an output, a mode accumulator, ...).
    pub fn add_to_sublist<T: Send + Sync + 'static, C: Send + Sync + 'static>(
        &self,
        target: &Arc<T>,
        select: fn(&T) -> &ChannelList<C>,
        channel: Arc<C>,
    ) {
        let mut items = LinkedList::new();
        items.push_back(channel);
        self.proc.fifo().push(Box::new(AddToSublist {
            target: Arc::clone(target),
            select,
            items,
        }));
    }

    /// Remove a contribution from a channel list; the contribution is
    /// dropped on the non-realtime side.
    pub fn rem_from_sublist<T: Send + Sync + 'static, C: Send + Sync + 'static>(
        &self,
        target: &Arc<T>,
        select: fn(&T) -> &ChannelList<C>,
        channel: &Arc<C>,
    ) {
        self.proc.fifo().push(Box::new(RemFromSublist {
            target: Arc::clone(target),
            select,
            victim: Arc::as_ptr(channel).cast::<()>() as usize,
            garbage: LinkedList::new(),
        }));
    }

    // ------------ queries ------------

    /// Subscribe to per-period level snapshots; delivered on the thread
    /// that drains the query queue (`process_query_cleanup`).
    pub fn subscribe_levels(
        &self,
        consumer: impl FnMut(&Levels) + Send + 'static,
    ) -> QueryArm {
        QueryArm::start(
            self.proc.query_fifo(),
            LevelQuery {
                source_list: Arc::clone(&self.source_list),
                meters: Arc::clone(&self.meters),
                snapshot: Levels::default(),
                valid: false,
                wanted_len: 0,
                consumer: Box::new(consumer),
            },
        )
    }

    /// Drain the query cleanup queue (non-realtime query thread).
    pub fn process_query_cleanup(&self) {
        self.proc.query_fifo().cleanup_commands();
    }

    // ------------ realtime driving ------------

    /// Run one audio period.  `render` is the renderer-specific middle
    /// part: process the source list and whatever intermediate lists the
    /// algorithm needs, then the output list.
    pub fn audio_callback_with(
        &self,
        frames: usize,
        inputs: &[&[Sample]],
        outputs: &mut [&mut [Sample]],
        render: impl FnOnce(&Self),
    ) -> RenderResult<()> {
        let block_size = self.block_size();
        if frames != block_size {
            return Err(RenderError::PeriodMismatch {
                expected: block_size,
                got: frames,
            });
        }
        let started = Instant::now();

        self.proc.process_commands();

        // Stash the host pointers, then fetch in parallel.
        self.input_list.for_each(|input| {
            input.set_host(inputs.get(input.channel()).copied());
        });
        self.proc.process_list(&self.input_list);

        render(self);

        let mut master = 0.0f32;
        for output in &self.outputs {
            master = master.max(output.base().level());
        }
        self.meters.master_level.store(master, Ordering::Relaxed);
        self.meters
            .frames
            .fetch_add(block_size as u64, Ordering::Relaxed);

        self.proc.process_queries();

        // Hand the rendered blocks to the host.
        for (k, host) in outputs.iter_mut().enumerate() {
            match self.outputs.get(k) {
                Some(output) => host.copy_from_slice(output.base().buffer()),
                None => host.fill(0.0),
            }
        }

        let budget = block_size as f32 / self.sample_rate() as f32;
        let load = started.elapsed().as_secs_f32() / budget;
        let smoothed = 0.9 * self.meters.cpu_load.load(Ordering::Relaxed) + 0.1 * load;
        self.meters.cpu_load.store(smoothed, Ordering::Relaxed);

        Ok(())
    }

    /// Process the source list (realtime thread).
    pub fn process_source_list(&self) {
        self.proc.process_list(&self.source_list);
    }

    /// Process the output list (realtime thread).
    pub fn process_output_list(&self) {
        self.proc.process_list(&self.output_list);
    }

    /// Process an auxiliary list of the renderer (realtime thread).
    pub fn process_aux_list<T: Processable + 'static>(&self, list: &RtList<Arc<T>>) {
        self.proc.process_list(list);
    }
}
