//! Integration tests for row planning: textual encoding and generated row grids.

use lightsheet_daq::error::DaqError;
use lightsheet_daq::experiment::{
    AxisRange, RangeSpec, RotationCalibration, RowGenerator, RowSpec, RunPlan,
};

#[test]
fn row_text_survives_a_persist_cycle() {
    let encoded = [
        "0,0,0,5",
        "12.5,-3,90,0:0.5:10",
        "1e-3,2,45,-20-20@15.5",
        "0.1,0.2,0.30000000000000004,-1:-0.25:-3",
    ];
    for text in encoded {
        let row: RowSpec = text.parse().unwrap();
        let again: RowSpec = row.to_string().parse().unwrap();
        assert_eq!(row, again, "{text}");
    }
}

#[test]
fn range_numbers_are_parsed_exactly() {
    let range: AxisRange = "0.1:0.2:0.7".parse().unwrap();
    match range {
        AxisRange::Stepped { start, step, end } => {
            assert_eq!(start.to_bits(), 0.1f64.to_bits());
            assert_eq!(step.to_bits(), 0.2f64.to_bits());
            assert_eq!(end.to_bits(), 0.7f64.to_bits());
        }
        other => panic!("expected stepped range, got {other:?}"),
    }
    assert_eq!(range.depth(), Some(4));
}

#[test]
fn sweep_has_no_fixed_depth() {
    let range: AxisRange = "-5-5@2".parse().unwrap();
    assert!(range.is_sweep());
    assert_eq!(range.depth(), None);
    assert_eq!(range.start(), -5.0);
    assert_eq!(range.end(), 5.0);
}

#[test]
fn malformed_rows_are_rejected_at_parse_time() {
    for bad in ["", "1,2,3", "a,0,0,0", "0,0,0,1:x:3", "0,0,0,0-10@0", "0,0,0,0-10@-1"] {
        let parsed = bad.parse::<RowSpec>();
        assert!(
            matches!(parsed, Err(DaqError::InvalidRange { .. })),
            "'{bad}' should not parse"
        );
    }
}

#[test]
fn generator_nests_angle_inside_y_inside_x() {
    let generator = RowGenerator::new(
        RangeSpec::new(0.0, 100.0, 200.0),
        RangeSpec::new(0.0, 50.0, 50.0),
        RangeSpec::new(0.0, 90.0, 90.0),
        AxisRange::stepped(0.0, 1.0, 10.0),
    );
    assert_eq!(generator.row_count(), 12);

    let rows = generator.generate();
    assert_eq!(rows.len(), 12);
    assert_eq!((rows[0].x, rows[0].y, rows[0].angle), (0.0, 0.0, 0.0));
    assert_eq!((rows[1].x, rows[1].y, rows[1].angle), (0.0, 0.0, 90.0));
    assert_eq!((rows[2].x, rows[2].y, rows[2].angle), (0.0, 50.0, 0.0));
    assert_eq!((rows[4].x, rows[4].y, rows[4].angle), (100.0, 0.0, 0.0));
    assert_eq!((rows[11].x, rows[11].y, rows[11].angle), (200.0, 50.0, 90.0));
    assert!(rows.iter().all(|r| r.depth() == Some(11)));
}

#[test]
fn rotated_rows_follow_the_calibrated_axis() {
    let generator = RowGenerator::new(
        RangeSpec::fixed(10.0),
        RangeSpec::fixed(0.0),
        RangeSpec::new(0.0, 90.0, 90.0),
        AxisRange::single(0.0),
    )
    .with_rotation(Some(RotationCalibration {
        origin_x: 0.0,
        origin_z: 0.0,
        clockwise: false,
    }));
    let rows = generator.generate();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].x, 10.0);
    // A quarter turn about the origin carries (10, 0) onto the Z axis.
    assert!(rows[1].x.abs() < 1e-9);
    assert!((rows[1].z.start().abs() - 10.0).abs() < 1e-9);
}

#[test]
fn plans_resolve_to_rows() {
    let plan = RunPlan::Generated(RowGenerator::new(
        RangeSpec::new(0.0, 1.0, 2.0),
        RangeSpec::fixed(0.0),
        RangeSpec::fixed(0.0),
        AxisRange::single(1.0),
    ));
    assert_eq!(plan.rows().len(), 3);

    let json = serde_json::to_string(&plan).unwrap();
    let back: RunPlan = serde_json::from_str(&json).unwrap();
    assert_eq!(back.rows(), plan.rows());
}
