//! Drift compensation end to end: a bead that wanders between time points must
//! be followed by the stage.

use lightsheet_daq::config::{AcquisitionConfig, ThresholdMode};
use lightsheet_daq::drift::{ChannelPicker, DriftEstimator, DriftTuning, RoiPick, Vector3};
use lightsheet_daq::experiment::{
    centroid_factory, projection_factory, AcquisitionSequencer, RowId, RowSpec, RunParameters,
    RunParametersBuilder, RunReport, RunStatus,
};
use lightsheet_daq::hardware::{Axis, MockMicroscope, MockScene};
use lightsheet_daq::sink::MemorySink;
use tracing_test::traced_test;

/// Slices per stack of `"0,0,0,0:1:10"`.
const DEPTH: usize = 11;

fn test_config() -> AcquisitionConfig {
    let mut config = AcquisitionConfig::default();
    config.motion.poll_interval_ms = 1;
    config.motion.creep_velocity = Some(1000.0);
    config
}

/// 32x32 mock with the bead centered in the stack, stepping by `step` once per stack.
fn drifting_scope(step: Vector3) -> MockMicroscope {
    MockMicroscope::new(32, 32).with_scene(MockScene {
        sample: Vector3::new(0.0, 0.0, 5.0),
        drift_step: step,
        drift_every: DEPTH,
        ..Default::default()
    })
}

fn run(
    scope: &MockMicroscope,
    config: AcquisitionConfig,
    timepoints: u32,
    params: RunParametersBuilder,
) -> RunReport {
    let params = params
        .rows(vec!["0,0,0,0:1:10".parse().unwrap()])
        .time_series(timepoints, 0.0)
        .build()
        .unwrap();
    AcquisitionSequencer::new(scope.clone(), config).run(params)
}

fn x_moves(scope: &MockMicroscope) -> Vec<(f64, f64)> {
    scope
        .moves()
        .into_iter()
        .filter(|m| m.axis == Axis::X)
        .map(|m| (m.target, m.velocity))
        .collect()
}

#[test]
fn centroid_follows_a_wandering_bead() {
    let scope = drifting_scope(Vector3::new(1.0, 0.0, 0.0));
    let (sink, _handle) = MemorySink::new();
    let report = run(
        &scope,
        test_config(),
        3,
        RunParameters::builder(Box::new(sink)).drift(centroid_factory()),
    );

    assert!(matches!(report.status, RunStatus::Completed), "{}", report.status);
    let (row, offset) = report.drift_offsets[0];
    assert_eq!(row, RowId(0));
    assert!((offset.x - 2.0).abs() < 0.05, "offset {offset}");
    assert!(offset.y.abs() < 0.05, "offset {offset}");
    assert!(offset.z.abs() < 0.05, "offset {offset}");

    // The third stack is approached from beyond the target at creep speed.
    let moves = x_moves(&scope);
    let [.., (waypoint, v1), (target, v2)] = moves.as_slice() else {
        panic!("expected at least two X moves, got {moves:?}");
    };
    assert!((waypoint - 1.5).abs() < 0.05, "{moves:?}");
    assert!((target - 1.0).abs() < 0.05, "{moves:?}");
    assert_eq!((*v1, *v2), (1000.0, 1000.0));
    assert_eq!(
        lightsheet_daq::hardware::Movable::velocity(&scope, Axis::X).unwrap(),
        1.0e6
    );
}

#[test]
fn previous_estimate_weight_is_halved() {
    let scope = drifting_scope(Vector3::new(1.0, 0.0, 0.0));
    let mut config = test_config();
    config.drift.ema_weight = 1.0;
    let (sink, _handle) = MemorySink::new();
    let report = run(
        &scope,
        config,
        2,
        RunParameters::builder(Box::new(sink)).drift(centroid_factory()),
    );

    let offset = report.drift_offsets[0].1;
    assert!((offset.x - 0.5).abs() < 0.05, "offset {offset}");
}

#[test]
#[traced_test]
fn large_jumps_are_clamped_to_the_midpoint() {
    let scope = drifting_scope(Vector3::new(4.0, 0.0, 0.0));
    let mut config = test_config();
    config.drift.reset_magnitude = 1.0;
    let (sink, _handle) = MemorySink::new();
    let report = run(
        &scope,
        config,
        2,
        RunParameters::builder(Box::new(sink)).drift(centroid_factory()),
    );

    let offset = report.drift_offsets[0].1;
    assert!((offset.x - 2.0).abs() < 0.05, "offset {offset}");
    assert!(logs_contain("using midpoint"));
}

#[test]
#[traced_test]
fn empty_threshold_window_falls_back_to_reference() {
    let scope = drifting_scope(Vector3::new(1.0, 0.0, 0.0));
    let mut config = test_config();
    config.drift.threshold = ThresholdMode::Absolute {
        low: 60_000.0,
        high: 65_535.0,
    };
    let (sink, _handle) = MemorySink::new();
    let report = run(
        &scope,
        config,
        3,
        RunParameters::builder(Box::new(sink)).drift(centroid_factory()),
    );

    assert!(matches!(report.status, RunStatus::Completed));
    assert_eq!(report.drift_offsets[0].1, Vector3::ZERO);
    assert!(logs_contain("Too few pixels passed the threshold; using reference position"));
}

#[test]
fn slowest_creep_velocity_covers_distant_rows() {
    let scope = drifting_scope(Vector3::new(1.0, 0.0, 0.0))
        .with_allowed_velocities(vec![100.0, 1.0e6]);
    let mut config = AcquisitionConfig::default();
    config.motion.poll_interval_ms = 1;
    config.motion.goal_timeout_ms = 50;
    assert_eq!(config.motion.creep_velocity, None);

    let (sink, _handle) = MemorySink::new();
    let params = RunParameters::builder(Box::new(sink))
        .drift(centroid_factory())
        .rows(vec![
            "0,0,0,0:1:10".parse().unwrap(),
            "40,0,0,0:1:10".parse().unwrap(),
        ])
        .time_series(3, 0.0)
        .build()
        .unwrap();
    let report = AcquisitionSequencer::new(scope.clone(), config).run(params);

    assert!(matches!(report.status, RunStatus::Completed), "{}", report.status);
    // Returning to row 0 from x = 40 at 100 units/s outlasts the 50 ms goal timeout.
    let moves = x_moves(&scope);
    assert!(moves.iter().any(|&(_, v)| v == 100.0), "{moves:?}");
    assert_ne!(report.drift_offsets[0].1, Vector3::ZERO);
}

#[test]
fn projection_correlation_recovers_lateral_drift() {
    let scope = drifting_scope(Vector3::new(3.0, 0.0, 0.0));
    let (sink, _handle) = MemorySink::new();
    let report = run(
        &scope,
        test_config(),
        2,
        RunParameters::builder(Box::new(sink)).drift(projection_factory()),
    );

    assert!(matches!(report.status, RunStatus::Completed), "{}", report.status);
    let offset = report.drift_offsets[0].1;
    assert!((offset.x - 3.0).abs() < 0.5, "offset {offset}");
    assert!(offset.y.abs() < 0.5, "offset {offset}");
    assert!(offset.z.abs() < 0.5, "offset {offset}");
}

#[test]
fn manual_picks_arrive_over_the_channel() {
    let scope = drifting_scope(Vector3::ZERO);
    let (picker, mut jobs) = ChannelPicker::channel(1);
    let ui = std::thread::spawn(move || {
        let picks = [
            RoiPick { x: 16.0, y: 16.0, slice: 5 },
            RoiPick { x: 18.0, y: 15.0, slice: 5 },
        ];
        let mut depths = Vec::new();
        for pick in picks {
            let job = jobs.blocking_recv().unwrap();
            depths.push(job.request.depth);
            assert_eq!(job.request.mip.dim(), (32, 32));
            job.reply.send(Some(pick)).unwrap();
        }
        depths
    });

    let factory = move |config: &AcquisitionConfig, _row: RowId, _spec: &RowSpec| {
        DriftEstimator::manual(DriftTuning::from(&config.drift), Box::new(picker.clone()))
    };
    let (sink, _handle) = MemorySink::new();
    let report = run(
        &scope,
        test_config(),
        2,
        RunParameters::builder(Box::new(sink)).drift(Box::new(factory)),
    );

    assert!(matches!(report.status, RunStatus::Completed), "{}", report.status);
    assert_eq!(ui.join().unwrap(), vec![DEPTH, DEPTH]);
    assert_eq!(report.drift_offsets[0].1, Vector3::new(2.0, -1.0, 0.0));
}
