// Macro file execution and the bounded context stack.

use std::fs;

use gantry::Config;
use gantry::sim::SimRig;
use tempfile::TempDir;

fn rig_with_macros(files: &[(&str, &str)]) -> (SimRig, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    for (name, body) in files {
        fs::write(dir.path().join(name), body).unwrap();
    }
    let mut config = Config::default();
    config.interpreter.macro_dir = dir.path().to_string_lossy().into_owned();
    (SimRig::new(&config), dir)
}

#[test]
fn macro_runs_and_returns_to_the_caller() {
    let (mut rig, _dir) = rig_with_macros(&[("square.g", "G91\nG1 X10 F600\nG1 Y10\nG90\n")]);

    rig.send("M98 Psquare.g");
    assert!(rig.run_until_idle(300));

    let executed = &rig.motion.executed;
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0].targets[0], 10.0);
    assert_eq!(executed[1].targets[1], 10.0);
    assert_eq!(rig.interp.stack_depth(), 0);
    assert!(!rig.interp.doing_file_macro());
}

#[test]
fn pop_restores_feed_rate_and_relative_flags() {
    // The macro flips to relative mode and a slow feed; both must be
    // restored on return.
    let (mut rig, _dir) = rig_with_macros(&[("wipe.g", "G91\nG1 X1 F600\n")]);

    rig.send("G90");
    rig.send("G1 X10 F3000");
    rig.send("M98 Pwipe.g");
    assert!(rig.run_until_idle(300));

    let ctx = rig.interp.source_context(rig.console);
    assert_eq!(ctx.feed_rate, 3000.0);
    assert!(!ctx.axes_relative);

    // Behavioral check: the next move is absolute at the restored feed.
    rig.send("G1 X7");
    assert!(rig.run_until_idle(100));
    let mv = rig.motion.executed.last().unwrap();
    assert_eq!(mv.targets[0], 7.0);
    assert_eq!(mv.feed_rate, 50.0);
}

#[test]
fn nested_macros_resume_the_parent_mid_file() {
    let (mut rig, _dir) = rig_with_macros(&[
        ("outer.g", "M98 Pinner.g\nG1 X2 F600\n"),
        ("inner.g", "G1 X1 F600\n"),
    ]);

    rig.send("G90");
    rig.send("M98 Pouter.g");
    assert!(rig.run_until_idle(300));

    // Inner's move first, then the line after the call in outer - the
    // parent resumes where it left off, not from the top.
    let executed = &rig.motion.executed;
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0].targets[0], 1.0);
    assert_eq!(executed[1].targets[0], 2.0);
}

#[test]
fn recursion_stops_at_the_depth_limit() {
    let (mut rig, _dir) = rig_with_macros(&[("loop.g", "M98 Ploop.g\n")]);

    rig.send("M98 Ploop.g");
    let mut max_depth = 0;
    for _ in 0..400 {
        rig.tick();
        max_depth = max_depth.max(rig.interp.stack_depth());
        if rig.idle() {
            break;
        }
    }

    assert_eq!(max_depth, 5);
    assert_eq!(rig.interp.stack_depth(), 0);
    let replies = rig.replies();
    let overflows: Vec<_> = replies.iter().filter(|r| r.contains("stack overflow")).collect();
    assert_eq!(overflows.len(), 1, "{replies:?}");
}

#[test]
fn missing_macro_is_a_visible_error() {
    let (mut rig, _dir) = rig_with_macros(&[]);

    rig.send("M98 Pnope.g");
    assert!(rig.run_until_idle(100));
    let replies = rig.replies();
    assert!(replies.iter().any(|r| r.contains("nope.g not found")), "{replies:?}");
}

#[test]
fn m99_returns_early() {
    let (mut rig, _dir) = rig_with_macros(&[("early.g", "G91\nG1 X1 F600\nM99\nG1 X2\n")]);

    rig.send("M98 Pearly.g");
    assert!(rig.run_until_idle(300));
    assert_eq!(rig.motion.executed.len(), 1);
}

#[test]
fn m99_outside_a_macro_is_an_error() {
    let (mut rig, _dir) = rig_with_macros(&[]);
    rig.send("M99");
    assert!(rig.run_until_idle(100));
    assert!(rig.replies().iter().any(|r| r.contains("not executing a macro")));
}

#[test]
fn explicit_push_pop_pairs_restore_context() {
    let (mut rig, _dir) = rig_with_macros(&[]);

    rig.send("G91");
    rig.send("M120");
    rig.send("G90");
    rig.send("M121");
    assert!(rig.run_until_idle(100));

    let ctx = rig.interp.source_context(rig.console);
    assert!(ctx.axes_relative, "pop must restore the relative flag");
    assert_eq!(rig.interp.stack_depth(), 0);
}

#[test]
fn pop_below_empty_reports_and_keeps_running() {
    let (mut rig, _dir) = rig_with_macros(&[]);

    rig.send("M121");
    rig.send("M114");
    assert!(rig.run_until_idle(100));

    let replies = rig.replies();
    assert!(replies.iter().any(|r| r.contains("stack underflow")), "{replies:?}");
    // The loop keeps ticking: the next command still executes.
    assert!(replies.iter().any(|r| r.starts_with("X:")));
}

#[test]
fn interactive_input_is_starved_while_a_macro_runs() {
    let (mut rig, _dir) = rig_with_macros(&[("long.g", "G91\nG1 X1 F600\nG1 X1\nG1 X1\nG1 X1\n")]);
    let aux = rig.interp.register_source("aux");

    rig.send("M98 Plong.g");
    rig.tick();
    assert!(rig.interp.doing_file_macro());

    rig.interp.push_line(aux, "M114");
    let mut replied_during_macro = false;
    while rig.interp.doing_file_macro() {
        rig.tick();
        if !rig.interp.drain_replies(aux).is_empty() {
            replied_during_macro = true;
        }
    }
    assert!(!replied_during_macro, "macro must have exclusive priority");

    assert!(rig.run_until_idle(100));
    assert_eq!(rig.interp.drain_replies(aux).len(), 1);
}
