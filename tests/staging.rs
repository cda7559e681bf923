// Move staging and coordinate transform, driven through the simulated rig.

use gantry::Config;
use gantry::motion::MotionBackend;
use gantry::sim::SimRig;

fn rig() -> SimRig {
    SimRig::new(&Config::default())
}

/// Dispatch everything queued on the console without pumping the executor,
/// so the staged move can be inspected in the mailbox.
fn settle(rig: &mut SimRig) {
    for _ in 0..20 {
        rig.interp.tick(&mut rig.motion, &mut rig.heat);
    }
}

fn run_setup(rig: &mut SimRig, lines: &[&str]) {
    for line in lines {
        rig.send(line);
    }
    assert!(rig.run_until_idle(200), "setup did not go idle");
}

#[test]
fn absolute_move_is_scaled_and_converted() {
    let mut rig = rig();
    run_setup(&mut rig, &["G90", "M82"]);

    rig.send("G1 X10 Y10 F3000");
    settle(&mut rig);

    let mv = rig.interp.staged_move().expect("move should be staged");
    assert_eq!(mv.targets, vec![10.0, 10.0, 0.0, 0.0]);
    // 3000 units/min == 50 units/sec.
    assert_eq!(mv.feed_rate, 50.0);
    assert_eq!(mv.move_type, 0);
    assert!(mv.endstops.is_empty());
    assert!(!mv.retraction);
}

#[test]
fn relative_move_adds_to_the_previous_target() {
    let mut rig = rig();
    run_setup(&mut rig, &["G90", "M82", "G1 X10 Y10 F3000"]);

    rig.send("G91");
    rig.send("G1 X5");
    assert!(rig.run_until_idle(100));

    // Second executed move lands at (15, 10), not at 5 from the origin.
    let second = rig.motion.executed.last().unwrap();
    assert_eq!(second.targets[0], 15.0);
    assert_eq!(second.targets[1], 10.0);
    // No F parameter: the earlier F3000 still governs.
    assert_eq!(second.feed_rate, 50.0);
}

#[test]
fn staging_fails_while_the_slot_is_occupied() {
    let mut rig = rig();
    rig.send("G90");
    rig.send("G1 X10 F3000");
    rig.send("G1 X20");
    settle(&mut rig);

    // First move occupies the slot; the second stays latched at its source.
    let staged = rig.interp.staged_move().expect("first move staged");
    assert_eq!(staged.targets[0], 10.0);
    assert!(rig.interp.input_pending());

    // More ticks change nothing while the executor has not claimed it.
    settle(&mut rig);
    assert_eq!(rig.interp.staged_move().unwrap().targets[0], 10.0);

    // Once the executor claims the slot, the latched move stages.
    let taken = rig.interp.take_staged_move().unwrap();
    assert_eq!(taken.targets[0], 10.0);
    settle(&mut rig);
    assert_eq!(rig.interp.staged_move().unwrap().targets[0], 20.0);
}

#[test]
fn inch_units_are_scaled_at_staging_time() {
    let mut rig = rig();
    run_setup(&mut rig, &["G90"]);

    rig.send("G20");
    rig.send("G1 X1 F60");
    settle(&mut rig);

    let mv = rig.interp.staged_move().unwrap();
    assert_eq!(mv.targets[0], 25.4);
    // F60 in/min == 25.4 units/sec.
    assert_eq!(mv.feed_rate, 25.4);
}

#[test]
fn speed_factor_scales_the_staged_feed_rate() {
    let mut rig = rig();
    run_setup(&mut rig, &["G90", "M220 S200"]);

    rig.send("G1 X10 F3000");
    settle(&mut rig);
    assert_eq!(rig.interp.staged_move().unwrap().feed_rate, 100.0);
}

#[test]
fn extrusion_accumulates_raw_totals_and_applies_factors() {
    let mut rig = rig();
    run_setup(&mut rig, &["T0 S0", "G90", "M83"]);

    rig.send("G1 X10 E2 F1200");
    assert!(rig.run_until_idle(100));

    let first = rig.motion.executed.last().unwrap();
    assert_eq!(first.targets[3], 2.0);
    assert!(first.use_pressure_advance);
    assert_eq!(rig.interp.machine().raw_extrusion_total, 2.0);
    assert_eq!(rig.interp.machine().raw_extrusion_by_drive[0], 2.0);

    // Halve the extrusion factor: commanded amounts shrink, raw totals
    // keep counting the commanded (pre-factor) distance.
    rig.send("M221 S50");
    rig.send("G1 X20 E2");
    assert!(rig.run_until_idle(100));

    let second = rig.motion.executed.last().unwrap();
    assert_eq!(second.targets[3], 1.0);
    assert_eq!(rig.interp.machine().raw_extrusion_total, 4.0);
}

#[test]
fn absolute_extrusion_stages_deltas() {
    let mut rig = rig();
    run_setup(&mut rig, &["T0 S0", "G90", "M82"]);

    rig.send("G1 E5 F300");
    rig.send("G1 E7");
    assert!(rig.run_until_idle(100));

    let moves = &rig.motion.executed;
    assert_eq!(moves[moves.len() - 2].targets[3], 5.0);
    assert_eq!(moves[moves.len() - 1].targets[3], 2.0);
    // Pure extrusion moves are not pressure-advance eligible.
    assert!(!moves[moves.len() - 1].use_pressure_advance);
}

#[test]
fn extruding_without_a_tool_is_an_error() {
    let mut rig = rig();
    rig.send("G1 X5 E1");
    assert!(rig.run_until_idle(100));
    let replies = rig.replies();
    assert!(replies.iter().any(|r| r.contains("no tool selected")), "{replies:?}");
}

#[test]
fn g92_sets_position_without_motion() {
    let mut rig = rig();
    run_setup(&mut rig, &["G90", "G92 X50 Y60 Z7"]);

    assert!(rig.motion.executed.is_empty());
    assert_eq!(rig.interp.machine().last_target[..3], [50.0, 60.0, 7.0]);
    assert_eq!(&rig.motion.live_position()[..3], &[50.0, 60.0, 7.0]);

    // A relative move builds on the new position.
    rig.send("G91");
    rig.send("G1 X5");
    assert!(rig.run_until_idle(100));
    assert_eq!(rig.motion.executed.last().unwrap().targets[0], 55.0);
}

#[test]
fn firmware_retraction_flags_the_staged_move() {
    let mut rig = rig();
    run_setup(&mut rig, &["T0 S0", "M207 S3 F1800"]);

    rig.send("G10");
    assert!(rig.run_until_idle(100));
    let retract = rig.motion.executed.last().unwrap();
    assert!(retract.retraction);
    assert_eq!(retract.targets[3], -3.0);
    assert_eq!(retract.feed_rate, 30.0);

    // Unretract feeds the length back.
    rig.send("G11");
    assert!(rig.run_until_idle(100));
    let unretract = rig.motion.executed.last().unwrap();
    assert!(unretract.retraction);
    assert_eq!(unretract.targets[3], 3.0);

    // A second G11 with nothing retracted is a no-op.
    let executed = rig.motion.executed.len();
    rig.send("G11");
    assert!(rig.run_until_idle(100));
    assert_eq!(rig.motion.executed.len(), executed);
}

#[test]
fn m114_reports_coordinates_to_the_requesting_source() {
    let mut rig = rig();
    run_setup(&mut rig, &["G90", "G92 X1.5 Y2 Z3"]);

    rig.send("M114");
    assert!(rig.run_until_idle(100));
    let replies = rig.replies();
    let report = replies.iter().find(|r| r.starts_with("X:")).expect("position report");
    assert!(report.contains("X:1.500"));
    assert!(report.contains("Y:2.000"));
    assert!(report.contains("Z:3.000"));
}
