// File printing, pause/resume snapshots and cancel.

use std::fs;

use gantry::Config;
use gantry::sim::SimRig;
use tempfile::TempDir;

// A print long enough that pause lands mid-file: header, fan command, then
// a run of extruding moves. 43 moves total, 41 of them extruding E1.
fn print_body() -> String {
    let mut body = String::from("G90\nM83\nG1 X10 Y10 F3000\nG1 X20 E1\nM106 S128\n");
    for i in 0..40 {
        body.push_str(&format!("G1 X{} E1\n", 21 + i));
    }
    body.push_str("G1 X60\n");
    body
}

fn printing_rig() -> (SimRig, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("part.g"), print_body()).unwrap();
    let mut config = Config::default();
    config.interpreter.gcode_dir = dir.path().to_string_lossy().into_owned();
    let mut rig = SimRig::new(&config);
    rig.send("T0 S0");
    assert!(rig.run_until_idle(100));
    (rig, dir)
}

#[test]
fn print_runs_to_completion() {
    let (mut rig, _dir) = printing_rig();

    rig.send("M23 Ppart.g");
    rig.send("M24");
    assert!(rig.run_until_idle(2000));

    assert!(!rig.interp.is_printing());
    assert_eq!(rig.motion.executed.len(), 43);
    assert_eq!(rig.motion.executed.last().unwrap().targets[0], 60.0);
    assert_eq!(rig.interp.machine().raw_extrusion_total, 41.0);
    assert!(rig.replies().iter().any(|r| r.contains("part.g selected")));
}

#[test]
fn staged_moves_carry_their_file_offset() {
    let (mut rig, _dir) = printing_rig();

    rig.send("M23 Ppart.g");
    rig.send("M24");
    assert!(rig.run_until_idle(2000));

    for m in &rig.motion.executed {
        assert!(m.file_offset.is_some(), "print moves carry provenance");
    }
    let offsets: Vec<u64> = rig.motion.executed.iter().filter_map(|m| m.file_offset).collect();
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    assert_eq!(offsets, sorted, "offsets advance monotonically");
}

#[test]
fn pause_snapshots_and_resume_restores_bit_identically() {
    let (mut rig, _dir) = printing_rig();

    rig.send("M23 Ppart.g");
    rig.send("M24");
    // Let the header and a stretch of moves go through.
    rig.run(30);
    assert!(rig.interp.is_printing());

    rig.send("M25");
    let mut ticks = 0;
    while !rig.interp.is_paused() {
        rig.tick();
        ticks += 1;
        assert!(ticks < 200, "pause never completed");
    }

    let position = rig.interp.machine().position();
    let fans = rig.interp.machine().fan_values.clone();
    let feed = rig.interp.source_context(rig.interp.file_source_id()).feed_rate;
    assert_eq!(fans[0], 128.0 / 255.0);

    // Paused: the machine stays where it is.
    rig.run(20);
    assert!(rig.interp.is_paused());
    assert_eq!(rig.interp.machine().position(), position);

    rig.send("M24");
    let mut ticks = 0;
    while rig.interp.is_paused() {
        rig.tick();
        ticks += 1;
        assert!(ticks < 300, "resume never completed");
    }

    assert_eq!(rig.interp.machine().position(), position);
    assert_eq!(rig.interp.machine().fan_values, fans);
    assert_eq!(
        rig.interp.source_context(rig.interp.file_source_id()).feed_rate,
        feed
    );

    // The rest of the file still prints.
    assert!(rig.run_until_idle(2000));
    assert!(!rig.interp.is_printing());
    assert_eq!(rig.motion.executed.last().unwrap().targets[0], 60.0);
}

#[test]
fn pause_without_a_print_is_an_error() {
    let (mut rig, _dir) = printing_rig();
    rig.send("M25");
    assert!(rig.run_until_idle(100));
    assert!(rig.replies().iter().any(|r| r.contains("no print in progress")));
}

#[test]
fn resume_without_a_file_is_an_error() {
    let (mut rig, _dir) = printing_rig();
    rig.send("M24");
    assert!(rig.run_until_idle(100));
    assert!(rig.replies().iter().any(|r| r.contains("no file selected")));
}

#[test]
fn cancel_discards_the_file_context_and_resets_accumulators() {
    let (mut rig, _dir) = printing_rig();

    rig.send("M23 Ppart.g");
    rig.send("M24");
    rig.run(30);
    assert!(rig.interp.is_printing());
    assert!(rig.interp.machine().raw_extrusion_total > 0.0);

    rig.send("M0");
    assert!(rig.run_until_idle(200));

    assert!(!rig.interp.is_printing());
    assert!(!rig.interp.is_paused());
    assert_eq!(rig.interp.machine().raw_extrusion_total, 0.0);
    assert!(rig.interp.staged_move().is_none());
}

#[test]
fn selecting_a_missing_file_is_an_error() {
    let (mut rig, _dir) = printing_rig();
    rig.send("M23 Pghost.g");
    assert!(rig.run_until_idle(100));
    assert!(rig.replies().iter().any(|r| r.contains("cannot open")));
}

#[test]
fn fraction_printed_advances() {
    let (mut rig, _dir) = printing_rig();

    rig.send("M23 Ppart.g");
    rig.send("M24");
    rig.run(10);
    let early = rig.interp.fraction_printed().expect("printing");
    rig.run(20);
    if let Some(later) = rig.interp.fraction_printed() {
        assert!(later >= early);
    }
}
