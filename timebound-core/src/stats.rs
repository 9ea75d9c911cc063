//! Statistics
//!
//! Collectors walk the CFG collection after a WCET computation and emit
//! per-block or per-access (address, size, value, context) tuples. The
//! standard collectors expose execution counts, accumulated execution time,
//! cache categories and miss counts. The WCET driver uses them to write a
//! machine-readable statistics file; a separate XML dump serializes the
//! whole CFG collection.

use crate::cache::Category;
use crate::cfg::dominance::loop_header;
use crate::ipet::{time, var, wcet};
use crate::prop::ContextPath;
use crate::workspace::Workspace;
use serde::Serialize;
use std::io::Write;

/// One collected record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatRecord {
    pub address: u32,
    pub size: u32,
    pub value: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context: ContextPath,
}

/// A statistics collector.
pub trait Collector {
    /// Stable identifier, `module/name`.
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn unit(&self) -> &'static str {
        ""
    }
    /// Overall value, when the statistic has a meaningful total.
    fn total(&self, _ws: &Workspace) -> Option<i64> {
        None
    }
    fn collect(&self, ws: &Workspace, sink: &mut dyn FnMut(StatRecord));
}

fn block_count(ws: &Workspace, c: u32, b: u32) -> Option<i64> {
    let sys = ws.system.as_ref()?;
    let v = *ws.cfgs.as_ref()?.get(c).block(b).props.get(var())?;
    Some(sys.value_of(v)?.round() as i64)
}

/// Per-block execution count.
pub struct TotalCountStat;

impl Collector for TotalCountStat {
    fn id(&self) -> &'static str {
        "ipet/total_count"
    }
    fn name(&self) -> &'static str {
        "Total Execution Count"
    }
    fn collect(&self, ws: &Workspace, sink: &mut dyn FnMut(StatRecord)) {
        let coll = match ws.cfgs.as_ref() {
            Some(c) => c,
            None => return,
        };
        for (c, cfg) in coll.iter() {
            for block in cfg.basic_blocks() {
                let (address, size) = match (block.address(), block.size()) {
                    (Some(a), s) => (a, s),
                    _ => continue,
                };
                if let Some(count) = block_count(ws, c, block.id) {
                    if count >= 0 {
                        sink(StatRecord { address, size, value: count, context: Vec::new() });
                    }
                }
            }
        }
    }
}

/// Per-block accumulated execution time.
pub struct TotalTimeStat;

impl Collector for TotalTimeStat {
    fn id(&self) -> &'static str {
        "ipet/total_time"
    }
    fn name(&self) -> &'static str {
        "Total Execution Time"
    }
    fn unit(&self) -> &'static str {
        "cycle"
    }
    fn total(&self, ws: &Workspace) -> Option<i64> {
        ws.props.get(wcet()).map(|&w| w as i64)
    }
    fn collect(&self, ws: &Workspace, sink: &mut dyn FnMut(StatRecord)) {
        let coll = match ws.cfgs.as_ref() {
            Some(c) => c,
            None => return,
        };
        for (c, cfg) in coll.iter() {
            for block in cfg.basic_blocks() {
                let (address, size) = match (block.address(), block.size()) {
                    (Some(a), s) => (a, s),
                    _ => continue,
                };
                let t = match block.props.get(time()) {
                    Some(&t) => t as i64,
                    None => continue,
                };
                if let Some(count) = block_count(ws, c, block.id) {
                    if count >= 0 {
                        sink(StatRecord {
                            address,
                            size,
                            value: count * t,
                            context: Vec::new(),
                        });
                    }
                }
            }
        }
    }
}

/// Per-access instruction-cache category, encoded 0..=4 in declaration
/// order (AH, AM, FM, FH, NC).
pub struct CategoryStat;

fn category_ordinal(cat: Category) -> i64 {
    match cat {
        Category::AlwaysHit => 0,
        Category::AlwaysMiss => 1,
        Category::FirstMiss(_) => 2,
        Category::FirstHit => 3,
        Category::NotClassified => 4,
    }
}

impl Collector for CategoryStat {
    fn id(&self) -> &'static str {
        "cache/category"
    }
    fn name(&self) -> &'static str {
        "Instruction Cache Category"
    }
    fn collect(&self, ws: &Workspace, sink: &mut dyn FnMut(StatRecord)) {
        let lbsets = match ws.lbsets.as_ref() {
            Some(l) => l,
            None => return,
        };
        for lbset in lbsets {
            for lb in &lbset.lblocks {
                sink(StatRecord {
                    address: lb.address,
                    size: lb.size,
                    value: category_ordinal(lb.category),
                    context: Vec::new(),
                });
            }
        }
    }
}

/// Per-access miss count from the solved system.
pub struct MissCountStat;

impl Collector for MissCountStat {
    fn id(&self) -> &'static str {
        "cache/misses"
    }
    fn name(&self) -> &'static str {
        "Instruction Cache Misses"
    }
    fn collect(&self, ws: &Workspace, sink: &mut dyn FnMut(StatRecord)) {
        let (lbsets, sys) = match (ws.lbsets.as_ref(), ws.system.as_ref()) {
            (Some(l), Some(s)) => (l, s),
            _ => return,
        };
        for lbset in lbsets {
            for lb in &lbset.lblocks {
                if lb.linked_to_prev {
                    continue; // counted on the group leader
                }
                let misses = lb
                    .miss_var
                    .and_then(|v| sys.value_of(v))
                    .map(|v| v.round() as i64);
                if let Some(misses) = misses {
                    sink(StatRecord {
                        address: lb.address,
                        size: lb.size,
                        value: misses,
                        context: Vec::new(),
                    });
                }
            }
        }
    }
}

/// The standard collector set.
pub fn standard() -> Vec<Box<dyn Collector>> {
    vec![
        Box::new(TotalCountStat),
        Box::new(TotalTimeStat),
        Box::new(CategoryStat),
        Box::new(MissCountStat),
    ]
}

#[derive(Serialize)]
struct StatDump<'a> {
    id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    unit: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    total: Option<i64>,
    records: Vec<StatRecord>,
}

/// Write the collected statistics as one JSON document.
pub fn write_stats(
    ws: &Workspace,
    collectors: &[Box<dyn Collector>],
    out: &mut impl Write,
) -> std::io::Result<()> {
    let mut dumps = Vec::new();
    for c in collectors {
        let mut records = Vec::new();
        c.collect(ws, &mut |r| records.push(r));
        dumps.push(StatDump {
            id: c.id(),
            name: c.name(),
            unit: c.unit(),
            total: c.total(ws),
            records,
        });
    }
    serde_json::to_writer_pretty(&mut *out, &dumps)?;
    writeln!(out)
}

/// Parse a statistics dump back to (id, records) pairs.
pub fn read_stats(text: &str) -> crate::error::Result<Vec<(String, Vec<StatRecord>)>> {
    #[derive(serde::Deserialize)]
    struct Dump {
        id: String,
        records: Vec<OwnedRecord>,
    }
    #[derive(serde::Deserialize)]
    struct OwnedRecord {
        address: u32,
        size: u32,
        value: i64,
    }
    let dumps: Vec<Dump> = serde_json::from_str(text)
        .map_err(|e| crate::error::AnalysisError::Configuration(format!("bad stats file: {}", e)))?;
    Ok(dumps
        .into_iter()
        .map(|d| {
            let records = d
                .records
                .into_iter()
                .map(|r| StatRecord {
                    address: r.address,
                    size: r.size,
                    value: r.value,
                    context: Vec::new(),
                })
                .collect();
            (d.id, records)
        })
        .collect())
}

/// Dump the CFG collection as XML: one `<cfg>` per graph, nested `<bb>`
/// elements with their instructions and the standard annotations as child
/// elements.
pub fn dump_xml(ws: &Workspace, out: &mut impl Write) -> std::io::Result<()> {
    let coll = match ws.cfgs.as_ref() {
        Some(c) => c,
        None => return Ok(()),
    };
    writeln!(out, "<?xml version=\"1.0\"?>")?;
    writeln!(out, "<cfg-collection>")?;
    for (c, cfg) in coll.iter() {
        writeln!(
            out,
            "  <cfg id=\"{}\" address=\"0x{:08X}\" label=\"{}\" number=\"{}\">",
            c,
            cfg.address,
            xml_escape(&cfg.label),
            cfg.blocks.len()
        )?;
        for block in &cfg.blocks {
            if !block.is_basic() {
                continue;
            }
            writeln!(
                out,
                "    <bb id=\"{}\" address=\"0x{:08X}\" size=\"{}\">",
                block.id,
                block.address().unwrap_or(0),
                block.size()
            )?;
            for inst in block.insts() {
                writeln!(
                    out,
                    "      <inst address=\"0x{:08X}\" size=\"{}\"/>",
                    inst.address, inst.size
                )?;
            }
            if let Some(&t) = block.props.get(time()) {
                writeln!(out, "      <property name=\"time\">{}</property>", t)?;
            }
            if block.props.get_or_default(loop_header()) {
                writeln!(out, "      <property name=\"loop-header\">true</property>")?;
            }
            if let (Some(&v), Some(sys)) = (block.props.get(var()), ws.system.as_ref()) {
                if let Some(count) = sys.value_of(v) {
                    writeln!(
                        out,
                        "      <property name=\"count\">{}</property>",
                        count.round() as i64
                    )?;
                }
            }
            writeln!(out, "    </bb>")?;
        }
        writeln!(out, "  </cfg>")?;
    }
    writeln!(out, "</cfg-collection>")
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}
