//! End-to-end renderer tests
//!
//! Drives the renderers through `audio_callback` exactly like a host
//! would, with the inert backend and explicit periods.

use sf_core::{Orientation, Params, Position, Sample, SourceModel};
use sf_render::binaural::BinauralRenderer;
use sf_render::brs::BrsRenderer;
use sf_render::generic::GenericRenderer;
use sf_render::hoa::NfcHoaRenderer;
use sf_render::wfs::WfsRenderer;
use sf_render::{IrData, LoudspeakerSetup};

const BLOCK: usize = 64;
const RATE: u32 = 44100;

fn engine_params() -> Params {
    Params::new()
        .with("block_size", BLOCK)
        .with("sample_rate", RATE)
}

/// Dirac IR set: `pairs` left/right pairs, each channel a one-sample
/// impulse with a distinct amplitude (channel c has amplitude (c+1)/10).
fn dirac_set(pairs: usize) -> IrData {
    IrData {
        sample_rate: RATE,
        channels: (0..2 * pairs)
            .map(|c| vec![(c + 1) as Sample / 10.0])
            .collect(),
    }
}

fn test_signal(seed: usize) -> Vec<Sample> {
    (0..BLOCK)
        .map(|i| ((i + seed * 31) as Sample * 0.37).sin() * 0.5)
        .collect()
}

/// Run one period with a single input channel and collect all outputs.
fn run_period<F>(callback: F, input: &[Sample], output_count: usize) -> Vec<Vec<Sample>>
where
    F: FnOnce(&[&[Sample]], &mut [&mut [Sample]]),
{
    let inputs: Vec<&[Sample]> = vec![input];
    let mut buffers: Vec<Vec<Sample>> = vec![vec![0.0; BLOCK]; output_count];
    {
        let mut outputs: Vec<&mut [Sample]> =
            buffers.iter_mut().map(|b| b.as_mut_slice()).collect();
        callback(&inputs, &mut outputs);
    }
    buffers
}

// ============ binaural ============

// A point source at (0, 2.5) picks the HRIR pair at 90 degrees relative
// to the reference and is attenuated by 0.5 / 2.5.
#[test]
fn binaural_picks_azimuth_pair() {
    let mut renderer = BinauralRenderer::new(&engine_params()).unwrap();
    renderer.load_hrirs(&dirac_set(4)).unwrap();

    let id = renderer.add_source().unwrap();
    renderer
        .set_source_position(id, Position::new(0.0, 2.5))
        .unwrap();
    renderer.set_source_model(id, SourceModel::Point).unwrap();

    renderer.activate().unwrap();

    let signal = test_signal(0);
    // First period fades the source in; later periods are steady state.
    for _ in 0..2 {
        run_period(
            |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
            &signal,
            2,
        );
    }
    let out = run_period(
        |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
        &signal,
        2,
    );

    // azimuth 90 degrees -> pair index 1 -> channels 2 (left) and 3
    // (right) with dirac amplitudes 0.3 and 0.4
    let weight = 0.5 / 2.5;
    for (ear, amplitude) in [(0, 0.3), (1, 0.4)] {
        for (got, x) in out[ear].iter().zip(&signal) {
            let expected = x * weight * amplitude;
            assert!(
                (got - expected).abs() < 1e-5,
                "ear {ear}: {got} vs {expected}"
            );
        }
    }

    renderer.deactivate().unwrap();
}

#[test]
fn binaural_mute_fades_to_silence() {
    let mut renderer = BinauralRenderer::new(&engine_params()).unwrap();
    renderer.load_hrirs(&dirac_set(2)).unwrap();
    let id = renderer.add_source().unwrap();
    renderer
        .set_source_position(id, Position::new(0.0, 2.0))
        .unwrap();
    renderer.activate().unwrap();

    let signal = test_signal(1);
    for _ in 0..3 {
        run_period(
            |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
            &signal,
            2,
        );
    }

    renderer.set_source_mute(id, true).unwrap();
    // fade-out period
    run_period(
        |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
        &signal,
        2,
    );
    // silent afterwards
    let out = run_period(
        |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
        &signal,
        2,
    );
    for ear in &out {
        assert!(ear.iter().all(|x| x.abs() < 1e-7), "not silent: {ear:?}");
    }

    renderer.deactivate().unwrap();
}

// Same scene rendered with 1 and 3 threads must produce identical output.
#[test]
fn binaural_thread_count_does_not_change_output() {
    let render_with = |threads: usize| -> Vec<Vec<Sample>> {
        let params = engine_params().with("threads", threads);
        let mut renderer = BinauralRenderer::new(&params).unwrap();
        renderer.load_hrirs(&dirac_set(8)).unwrap();

        for k in 0..5 {
            let id = renderer.add_source().unwrap();
            renderer
                .set_source_position(id, Position::new(k as Sample - 2.0, 2.0))
                .unwrap();
        }
        renderer.activate().unwrap();

        let signal = test_signal(2);
        let mut last = Vec::new();
        for _ in 0..4 {
            last = run_period(
                |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
                &signal,
                2,
            );
        }
        renderer.deactivate().unwrap();
        last
    };

    let single = render_with(1);
    let multi = render_with(3);
    for (a, b) in single.iter().zip(&multi) {
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-6);
        }
    }
}

// After removing all sources and deactivating, no items remain in the
// realtime lists.
#[test]
fn binaural_deactivate_completeness() {
    let mut renderer = BinauralRenderer::new(&engine_params()).unwrap();
    renderer.load_hrirs(&dirac_set(2)).unwrap();
    for _ in 0..3 {
        renderer.add_source().unwrap();
    }
    renderer.activate().unwrap();

    let signal = test_signal(3);
    run_period(
        |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
        &signal,
        2,
    );

    renderer.rem_all_sources().unwrap();
    renderer.deactivate().unwrap();

    assert_eq!(renderer.source_count(), 0);
    assert!(renderer.source_list().is_empty());
}

#[test]
fn binaural_rejects_odd_channel_count() {
    let mut renderer = BinauralRenderer::new(&engine_params()).unwrap();
    let bad = IrData {
        sample_rate: RATE,
        channels: vec![vec![1.0]; 3],
    };
    assert!(renderer.load_hrirs(&bad).is_err());
}

#[test]
fn callback_rejects_wrong_period() {
    let mut renderer = BinauralRenderer::new(&engine_params()).unwrap();
    renderer.load_hrirs(&dirac_set(2)).unwrap();
    renderer.activate().unwrap();

    let signal = vec![0.0; 32];
    let inputs: Vec<&[Sample]> = vec![&signal];
    let mut left = vec![0.0; 32];
    let mut right = vec![0.0; 32];
    let mut outputs: Vec<&mut [Sample]> = vec![&mut left, &mut right];
    assert!(renderer.audio_callback(32, &inputs, &mut outputs).is_err());

    renderer.deactivate().unwrap();
}

#[test]
fn binaural_level_query() {
    let mut renderer = BinauralRenderer::new(&engine_params()).unwrap();
    renderer.load_hrirs(&dirac_set(2)).unwrap();
    let id = renderer.add_source().unwrap();
    renderer
        .set_source_position(id, Position::new(0.0, 1.0))
        .unwrap();
    renderer.activate().unwrap();

    let snapshots = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&snapshots);
    let arm = renderer.subscribe_levels(move |levels| {
        sink.lock().unwrap().push(levels.clone());
    });

    let signal = test_signal(4);
    for _ in 0..4 {
        run_period(
            |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
            &signal,
            2,
        );
        renderer.process_query_cleanup();
    }
    arm.disarm();

    let snapshots = snapshots.lock().unwrap();
    // The first cycle only sizes the snapshot storage; later cycles carry
    // data.
    let last = snapshots.last().expect("no snapshot delivered");
    assert_eq!(last.source_levels.len(), 1);
    assert_eq!(last.source_levels[0].0, id);
    assert!(last.source_levels[0].1 > 0.0);
    assert!(last.master_level > 0.0);
    assert!(last.frames >= BLOCK as u64);

    drop(snapshots);
    renderer.deactivate().unwrap();
}

// ============ BRS ============

#[test]
fn brs_switches_pair_with_listener_orientation() {
    let mut renderer = BrsRenderer::new(&engine_params()).unwrap();
    renderer.load_reproduction_setup().unwrap();

    // two orientation steps: pair 0 centered at 90 deg, pair 1 at 270 deg
    let id = renderer.add_source(&dirac_set(2)).unwrap();
    renderer.set_reference_orientation(Orientation::new(90.0));
    renderer.activate().unwrap();

    let signal = test_signal(5);
    for _ in 0..3 {
        run_period(
            |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
            &signal,
            2,
        );
    }
    let out = run_period(
        |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
        &signal,
        2,
    );
    // pair 0: amplitudes 0.1 / 0.2
    for (got, x) in out[0].iter().zip(&signal) {
        assert!((got - x * 0.1).abs() < 1e-5);
    }
    for (got, x) in out[1].iter().zip(&signal) {
        assert!((got - x * 0.2).abs() < 1e-5);
    }

    // Turn the listener around; after the crossfade and queue rotations
    // the other pair is active.
    renderer.set_reference_orientation(Orientation::new(270.0));
    for _ in 0..4 {
        run_period(
            |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
            &signal,
            2,
        );
    }
    let out = run_period(
        |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
        &signal,
        2,
    );
    // pair 1: amplitudes 0.3 / 0.4
    for (got, x) in out[0].iter().zip(&signal) {
        assert!((got - x * 0.3).abs() < 1e-5);
    }
    for (got, x) in out[1].iter().zip(&signal) {
        assert!((got - x * 0.4).abs() < 1e-5);
    }

    renderer.rem_source(id).unwrap();
    renderer.deactivate().unwrap();
}

// ============ generic ============

#[test]
fn generic_renders_fir_matrix() {
    let mut renderer = GenericRenderer::new(&engine_params()).unwrap();
    renderer
        .load_reproduction_setup(&LoudspeakerSetup::circular(2, 1.0))
        .unwrap();

    // loudspeaker 0: identity; loudspeaker 1: two-sample delay
    let ir = IrData {
        sample_rate: RATE,
        channels: vec![vec![1.0], vec![0.0, 0.0, 1.0]],
    };
    renderer.add_source(&ir).unwrap();
    renderer.activate().unwrap();

    let signal = test_signal(6);
    let mut out = Vec::new();
    for _ in 0..3 {
        out = run_period(
            |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
            &signal,
            2,
        );
    }

    for (got, x) in out[0].iter().zip(&signal) {
        assert!((got - x).abs() < 1e-5);
    }
    // Two-sample delay; the same block repeats, so it wraps around.
    for i in 0..BLOCK {
        let expected = signal[(i + BLOCK - 2) % BLOCK];
        assert!((out[1][i] - expected).abs() < 1e-5);
    }

    renderer.deactivate().unwrap();
}

#[test]
fn generic_rejects_channel_mismatch() {
    let mut renderer = GenericRenderer::new(&engine_params()).unwrap();
    renderer
        .load_reproduction_setup(&LoudspeakerSetup::circular(4, 1.0))
        .unwrap();
    let ir = IrData {
        sample_rate: RATE,
        channels: vec![vec![1.0]; 3],
    };
    assert!(renderer.add_source(&ir).is_err());
}

// ============ WFS ============

fn wfs_renderer(max_delay: usize, initial_delay: usize) -> WfsRenderer {
    let params = engine_params()
        .with("delayline_size", max_delay)
        .with("initial_delay", initial_delay);
    let mut renderer = WfsRenderer::new(&params).unwrap();
    renderer.set_prefilter(&[1.0]).unwrap();
    renderer
        .load_reproduction_setup(&LoudspeakerSetup::circular(8, 1.5))
        .unwrap();
    renderer
}

// A point source collocated with the reference is focused and selected
// by no loudspeaker; all outputs stay silent.
#[test]
fn wfs_source_at_reference_is_silent() {
    let mut renderer = wfs_renderer(1024, 0);
    let id = renderer.add_source().unwrap();
    renderer
        .set_source_position(id, Position::new(0.0, 0.0))
        .unwrap();
    renderer.activate().unwrap();

    let signal = vec![1.0; BLOCK];
    for _ in 0..4 {
        let out = run_period(
            |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
            &signal,
            8,
        );
        for (speaker, block) in out.iter().enumerate() {
            assert!(
                block.iter().all(|x| x.abs() < 1e-7),
                "speaker {speaker} not silent"
            );
        }
    }

    renderer.deactivate().unwrap();
}

// A source behind the nearest loudspeaker arrives with the geometric
// delay and the 1/sqrt(r) * distance weighting.
#[test]
fn wfs_geometric_delay_and_weight() {
    let mut renderer = wfs_renderer(1024, 0);
    let id = renderer.add_source().unwrap();
    // straight ahead, 1.5 m behind the loudspeaker at (0, 1.5)
    renderer
        .set_source_position(id, Position::new(0.0, 3.0))
        .unwrap();
    renderer.activate().unwrap();

    let mut impulse = vec![0.0; BLOCK];
    impulse[0] = 1.0;
    let silence = vec![0.0; BLOCK];

    // speaker 2 of the circular setup sits at azimuth 90, i.e. (0, 1.5)
    let expected_delay =
        (1.5 / sf_core::SPEED_OF_SOUND * RATE as Sample + 0.5) as usize;
    let expected_weight = (1.0 / (1.5 as Sample).sqrt()) * (0.5 / 3.0);

    let mut collected = Vec::new();
    for period in 0..6 {
        let input = if period == 0 { &impulse } else { &silence };
        let out = run_period(
            |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
            input,
            8,
        );
        collected.extend_from_slice(&out[2]);
    }

    let peak_index = collected
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map(|(i, _)| i)
        .unwrap();
    assert_eq!(peak_index, expected_delay);
    assert!(
        (collected[peak_index] - expected_weight).abs() < 0.05 * expected_weight,
        "{} vs {}",
        collected[peak_index],
        expected_weight
    );
}

// An out-of-range delay must silence the contribution, not fault.
#[test]
fn wfs_invalid_delay_renders_silence() {
    // Delay line much too short for the geometry.
    let mut renderer = wfs_renderer(16, 0);
    let id = renderer.add_source().unwrap();
    renderer
        .set_source_position(id, Position::new(0.0, 30.0))
        .unwrap();
    renderer.activate().unwrap();

    let signal = vec![1.0; BLOCK];
    for _ in 0..3 {
        let out = run_period(
            |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
            &signal,
            8,
        );
        for block in &out {
            assert!(block.iter().all(|x| x.abs() < 1e-7));
        }
    }

    renderer.deactivate().unwrap();
}

// ============ NFC-HOA ============

#[test]
fn hoa_field_peaks_at_source_direction() {
    let mut renderer = NfcHoaRenderer::new(&engine_params()).unwrap();
    renderer
        .load_reproduction_setup(&LoudspeakerSetup::circular(8, 1.5))
        .unwrap();

    let id = renderer.add_source().unwrap();
    renderer
        .set_source_position(id, Position::new(2.5, 0.0))
        .unwrap();
    renderer.activate().unwrap();

    let signal = test_signal(7);
    let mut out = Vec::new();
    for _ in 0..6 {
        out = run_period(
            |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
            &signal,
            8,
        );
    }

    let energy: Vec<Sample> = out
        .iter()
        .map(|block| block.iter().map(|x| x * x).sum::<Sample>())
        .collect();

    // Mode rotation maps the source azimuth 0 onto ring position 90
    // degrees, which is loudspeaker 2 of this setup; the opposite side of
    // the ring gets the least energy.
    assert!(
        energy[2] > energy[6],
        "field does not point at the source: {energy:?}"
    );

    // The field is symmetric around the source direction.
    for (a, b) in [(1, 3), (0, 4), (7, 5)] {
        let (ea, eb) = (energy[a], energy[b]);
        assert!(
            (ea - eb).abs() < 0.05 * ea.max(eb).max(1e-9),
            "asymmetric field: speaker {a} = {ea}, speaker {b} = {eb}"
        );
    }

    renderer.rem_source(id).unwrap();
    renderer.deactivate().unwrap();
}

#[test]
fn hoa_rejects_subwoofers() {
    let mut renderer = NfcHoaRenderer::new(&engine_params()).unwrap();
    let mut setup = LoudspeakerSetup::circular(4, 1.5);
    setup
        .speakers
        .push(sf_render::Loudspeaker::subwoofer(Position::new(0.0, 0.0)));
    assert!(renderer.load_reproduction_setup(&setup).is_err());
}

#[test]
fn hoa_silence_in_silence_out() {
    let mut renderer = NfcHoaRenderer::new(&engine_params()).unwrap();
    renderer
        .load_reproduction_setup(&LoudspeakerSetup::circular(6, 1.5))
        .unwrap();
    let id = renderer.add_source().unwrap();
    renderer
        .set_source_position(id, Position::new(2.0, 1.0))
        .unwrap();
    renderer.set_source_mute(id, true).unwrap();
    renderer.activate().unwrap();

    let signal = test_signal(8);
    for _ in 0..3 {
        let out = run_period(
            |i, o| renderer.audio_callback(BLOCK, i, o).unwrap(),
            &signal,
            6,
        );
        for block in &out {
            assert!(block.iter().all(|x| x.abs() < 1e-6));
        }
    }

    renderer.deactivate().unwrap();
}
