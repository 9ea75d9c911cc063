//! CLI Commands

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use timebound_core::cfg::dominance::DomInfo;
use timebound_core::cfg::loops::LoopForest;
use timebound_core::flowfacts::FlowFacts;
use timebound_core::hard::HardwareConfig;
use timebound_core::ilp::{LpSolve, Solver};
use timebound_core::proc::{self, Registry};
use timebound_core::{stats, workspace, Workspace};

/// Common inputs of the analysis commands.
pub struct Inputs {
    pub program: PathBuf,
    pub hardware: Option<PathBuf>,
    pub flowfacts: Option<PathBuf>,
    pub entry: Option<String>,
    pub explicit: bool,
    pub virtualize: bool,
    pub unroll: bool,
    pub restructure: bool,
}

pub fn build_workspace(inputs: &Inputs) -> Result<Workspace> {
    let program = crate::program::load(&inputs.program)?;
    let hardware = match &inputs.hardware {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read hardware '{}'", path.display()))?;
            serde_json::from_str::<HardwareConfig>(&text)
                .with_context(|| format!("bad hardware description '{}'", path.display()))?
        }
        None => HardwareConfig::default(),
    };
    let flow_facts = match &inputs.flowfacts {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read flow facts '{}'", path.display()))?;
            let facts = FlowFacts::parse(&text)?;
            let image = std::fs::read(&inputs.program)?;
            facts.verify_checksum(&image)?;
            facts
        }
        None => FlowFacts::default(),
    };

    let mut ws = Workspace::new(program, hardware, flow_facts);
    if let Some(entry) = &inputs.entry {
        ws.config.set(workspace::entry_cfg(), entry.clone());
    }
    ws.config.set(workspace::explicit(), inputs.explicit);
    ws.config.set(workspace::do_virtualize(), inputs.virtualize);
    ws.config.set(workspace::do_unroll(), inputs.unroll);
    ws.config.set(workspace::do_restructure(), inputs.restructure);
    Ok(ws)
}

fn progress(msg: &'static str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("static template"),
    );
    bar.set_message(msg);
    bar
}

/// Compute and print the WCET.
pub fn wcet(
    inputs: &Inputs,
    lp_out: Option<&Path>,
    stats_out: Option<&Path>,
    xml_out: Option<&Path>,
) -> Result<()> {
    let mut ws = build_workspace(inputs)?;
    let registry = Registry::standard();
    let solver = LpSolve::find()?;

    let bar = progress("analyzing task...");
    let wcet = proc::run_wcet(&mut ws, &registry, &solver)?;
    bar.finish_and_clear();

    if let Some(path) = lp_out {
        let mut f = std::fs::File::create(path)?;
        ws.system
            .as_ref()
            .expect("system assembled")
            .dump_lp(&mut f)?;
        log::info!("ILP system written to {}", path.display());
    }
    if let Some(path) = stats_out {
        let mut f = std::fs::File::create(path)?;
        stats::write_stats(&ws, &stats::standard(), &mut f)?;
        log::info!("statistics written to {}", path.display());
    }
    if let Some(path) = xml_out {
        let mut f = std::fs::File::create(path)?;
        stats::dump_xml(&ws, &mut f)?;
        log::info!("XML dump written to {}", path.display());
    }

    let label = ws
        .cfgs
        .as_ref()
        .map(|c| c.entry_cfg().label.clone())
        .unwrap_or_else(|| "task".to_string());
    println!("wcet[{}] = {} cycles", label, wcet);
    Ok(())
}

/// Assemble the ILP system and dump it without solving.
pub fn dump_lp(inputs: &Inputs, out: Option<&Path>) -> Result<()> {
    let mut ws = build_workspace(inputs)?;
    let registry = Registry::standard();
    proc::assemble(&mut ws, &registry)?;
    let sys = ws.system.as_ref().expect("system assembled");
    match out {
        Some(path) => {
            let mut f = std::fs::File::create(path)?;
            sys.dump_lp(&mut f)?;
        }
        None => {
            sys.dump_lp(&mut std::io::stdout().lock())?;
        }
    }
    Ok(())
}

/// Print a flow-fact template: one `loop <addr> ?;` line per loop, indented
/// by nesting depth, function by function.
pub fn mkff(inputs: &Inputs) -> Result<()> {
    let mut ws = build_workspace(inputs)?;
    let registry = Registry::standard();
    registry.require(&mut ws, proc::COLLECTED_CFG)?;

    let coll = ws.collection()?;
    for (_, cfg) in coll.iter() {
        let dom = DomInfo::compute(cfg);
        let forest = LoopForest::build(cfg, &dom);
        if forest.loops.is_empty() {
            continue;
        }
        println!("// Function {}", cfg.label);
        // walk the loop forest top-down, depth-first
        let mut stack: Vec<u32> = forest.top.iter().rev().copied().collect();
        while let Some(h) = stack.pop() {
            let info = forest.of(h).expect("forest header");
            let addr = cfg.block(h).address().unwrap_or(cfg.address);
            let indent = " ".repeat((info.depth as usize).saturating_sub(1));
            println!("{}loop 0x{:08X} ?;", indent, addr);
            for &child in info.children.iter().rev() {
                stack.push(child);
            }
        }
        println!();
    }
    Ok(())
}
