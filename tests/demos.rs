use wslice::builder::{build, Function};
use wslice::stats::SliceStats;
use wslice::transfer::annotate;
use wslice::{Label, Options, Slicer};

fn load(json: &str) -> Function {
    serde_json::from_str(json).unwrap()
}

#[test]
fn if_else_demo() {
    let func = load(include_str!("../demos/if_else.json"));
    let cfg = annotate(&build(&func).unwrap(), Options::default()).unwrap();
    let slicer = Slicer::new(&cfg).unwrap();
    let sliced = slicer.slice(Label::Instr(9)).unwrap();
    assert_eq!(SliceStats::of(&sliced).instrs, 6);
}

#[test]
fn loop_sum_demo() {
    let func = load(include_str!("../demos/loop_sum.json"));
    let cfg = annotate(&build(&func).unwrap(), Options::default()).unwrap();
    let slicer = Slicer::new(&cfg).unwrap();

    // The returned sum depends on every instruction of the loop.
    let kept = slicer.instructions_to_keep(Label::Instr(11)).unwrap();
    for label in 1..=11 {
        assert!(kept.contains(&Label::Instr(label)), "missing {}", label);
    }

    // The loop branch needs the loop header, which joins both locals, but
    // nothing after the loop.
    let kept = slicer.instructions_to_keep(Label::Instr(9)).unwrap();
    assert!(kept.contains(&Label::Merge(1)));
    for label in [10, 11] {
        assert!(!kept.contains(&Label::Instr(label)), "kept {}", label);
    }
    let sliced = slicer.slice(Label::Instr(9)).unwrap();
    annotate(&sliced, Options::default()).unwrap();
}
