use anyhow::Context;
use std::path::{Path, PathBuf};
use structopt::StructOpt;
use wslice::builder::{self, Function};
use wslice::cfg::{BlockContent, Cfg};
use wslice::instr::InstrRef;
use wslice::stats::SliceStats;
use wslice::use_def::UseDefs;
use wslice::{transfer, Label, Options, Slicer, State};

/// Precision toggles shared by every subcommand.
#[derive(Clone, Debug, StructOpt)]
pub struct AnalysisFlags {
    /// `local.get` reuses the local's identifier.
    #[structopt(long = "propagate-locals")]
    propagate_locals: bool,

    /// `global.get` reuses the global's identifier.
    #[structopt(long = "propagate-globals")]
    propagate_globals: bool,

    /// Equal literals share one identifier.
    #[structopt(long = "use-constants")]
    use_constants: bool,
}

impl AnalysisFlags {
    fn options(&self) -> Options {
        Options {
            propagate_locals: self.propagate_locals,
            propagate_globals: self.propagate_globals,
            use_constants: self.use_constants,
        }
    }
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// Print the symbolic state before and after every instruction.
    Annotate {
        /// The input function, as JSON.
        #[structopt(short = "i")]
        input: PathBuf,

        #[structopt(flatten)]
        flags: AnalysisFlags,
    },

    /// Print the reaching definition of every use.
    UseDef {
        /// The input function, as JSON.
        #[structopt(short = "i")]
        input: PathBuf,

        #[structopt(flatten)]
        flags: AnalysisFlags,
    },

    /// Slice a function backward from one instruction or merge block.
    Slice {
        /// The input function, as JSON.
        #[structopt(short = "i")]
        input: PathBuf,

        /// The slicing criterion: an instruction label, or `merge<N>`.
        #[structopt(short = "c")]
        criterion: Label,

        /// Where to write the sliced CFG, as JSON.
        #[structopt(short = "o")]
        output: Option<PathBuf>,

        /// Show block and instruction counts before and after slicing.
        #[structopt(long = "show-stats")]
        show_stats: bool,

        #[structopt(flatten)]
        flags: AnalysisFlags,
    },
}

fn main() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let cmd = Command::from_args();

    match cmd {
        Command::Annotate { input, flags } => annotate(&input, flags.options()),
        Command::UseDef { input, flags } => use_def(&input, flags.options()),
        Command::Slice {
            input,
            criterion,
            output,
            show_stats,
            flags,
        } => slice(&input, criterion, output, show_stats, flags.options()),
    }
}

fn load(input: &Path, options: Options) -> anyhow::Result<Cfg<State>> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("reading {}", input.display()))?;
    let func: Function = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", input.display()))?;
    let cfg = builder::build(&func)?;
    let annotated = transfer::annotate(&cfg, options).context("analysis failed")?;
    log::debug!("analyzed {} blocks", annotated.blocks.len());
    Ok(annotated)
}

fn print_cfg<A, F: Fn(&A) -> Option<String>>(cfg: &Cfg<A>, show: F) {
    for (idx, block) in &cfg.blocks {
        let kind = match &block.content {
            BlockContent::Data(_) => "data",
            BlockContent::Control(_) => "control",
            BlockContent::Merge => "merge",
        };
        let succs = cfg
            .successors(*idx)
            .iter()
            .map(|e| match e.cond {
                Some(cond) => format!("{}({})", e.block, cond),
                None => e.block.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        println!("block {} ({}) -> [{}]", idx, kind, succs);
        if block.is_merge() {
            if let Some(state) = show(&block.after) {
                println!("  {}: {}", Label::Merge(*idx), state);
            }
        }
        for instr in block.instrs() {
            match instr {
                InstrRef::Data(i) => println!("  {}: {:?}", i.label, i.op),
                InstrRef::Control(i) => println!("  {}: {:?}", i.label, i.op),
            }
            if let (Some(before), Some(after)) = (show(instr.before()), show(instr.after())) {
                println!("      before {}", before);
                println!("      after  {}", after);
            }
        }
    }
}

fn annotate(input: &Path, options: Options) -> anyhow::Result<()> {
    let cfg = load(input, options)?;
    print_cfg(&cfg, |state| Some(state.to_string()));
    Ok(())
}

fn use_def(input: &Path, options: Options) -> anyhow::Result<()> {
    let cfg = load(input, options)?;
    let use_defs = UseDefs::build(&cfg)?;
    for (u, def) in &use_defs.chains {
        println!("{} <- {}", u, def);
    }
    Ok(())
}

fn slice(
    input: &Path,
    criterion: Label,
    output: Option<PathBuf>,
    show_stats: bool,
    options: Options,
) -> anyhow::Result<()> {
    let cfg = load(input, options)?;
    let slicer = Slicer::new(&cfg)?;
    let kept = slicer.instructions_to_keep(criterion)?;
    let sliced = slicer.slice(criterion)?;

    let labels = kept.iter().map(|l| l.to_string()).collect::<Vec<_>>();
    println!("kept: {}", labels.join(" "));
    print_cfg(&sliced, |_| None);

    if show_stats {
        let before = SliceStats::of(&cfg);
        let after = SliceStats::of(&sliced);
        eprintln!(
            "original: {} blocks, {} insts",
            before.blocks, before.instrs
        );
        eprintln!(
            "   sliced: {} blocks, {} insts, {} placeholders",
            after.blocks, after.instrs, after.synthetic
        );
    }

    if let Some(output) = output {
        let json = serde_json::to_string_pretty(&sliced)?;
        std::fs::write(&output, json)
            .with_context(|| format!("writing {}", output.display()))?;
    }

    Ok(())
}
