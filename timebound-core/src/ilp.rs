//! ILP Model
//!
//! Variables, linear constraints and the objective function of the IPET
//! system, its LP-format serialization (objective first, one line per
//! constraint), and the solver facade. Solving itself is external: the
//! default facade locates an `lp_solve` binary and shells out.

use crate::error::{AnalysisError, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write;

/// Index of a variable in its system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarKind {
    #[default]
    Int,
    Bin,
    Real,
}

#[derive(Debug, Clone)]
pub struct Var {
    pub name: String,
    pub kind: VarKind,
}

/// Constraint comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comp {
    Eq,
    Le,
    Ge,
}

impl Comp {
    pub fn symbol(&self) -> &'static str {
        match self {
            Comp::Eq => "=",
            Comp::Le => "<=",
            Comp::Ge => ">=",
        }
    }
}

/// One linear constraint: a weighted sum of variables on the left, a
/// constant on the right.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub label: String,
    pub comp: Comp,
    pub rhs: f64,
    pub terms: Vec<(f64, VarId)>,
}

impl Constraint {
    pub fn new(label: impl Into<String>, comp: Comp, rhs: f64) -> Constraint {
        Constraint { label: label.into(), comp, rhs, terms: Vec::new() }
    }

    /// Add `coef * var` to the left-hand side.
    pub fn add_lhs(&mut self, coef: f64, var: VarId) -> &mut Self {
        self.terms.push((coef, var));
        self
    }

    /// Add `coef * var` to the right-hand side.
    pub fn add_rhs(&mut self, coef: f64, var: VarId) -> &mut Self {
        self.terms.push((-coef, var));
        self
    }

    /// Add a constant to the right-hand side.
    pub fn add_rhs_const(&mut self, c: f64) -> &mut Self {
        self.rhs += c;
        self
    }

    /// Coefficient of a variable on the (normalized) left-hand side.
    pub fn coefficient(&self, var: VarId) -> f64 {
        self.terms
            .iter()
            .filter(|(_, v)| *v == var)
            .map(|(c, _)| c)
            .sum()
    }
}

/// The assembled ILP system.
#[derive(Debug, Default, Clone)]
pub struct IlpSystem {
    vars: Vec<Var>,
    cons: Vec<Constraint>,
    pub objective: Vec<(f64, VarId)>,
    solution: Option<Vec<f64>>,
}

impl IlpSystem {
    pub fn new() -> IlpSystem {
        IlpSystem::default()
    }

    pub fn new_var(&mut self, name: Option<String>, kind: VarKind) -> VarId {
        let id = VarId(self.vars.len() as u32);
        let name = name.unwrap_or_else(|| format!("x{}", id.0));
        self.vars.push(Var { name, kind });
        id
    }

    pub fn add(&mut self, cons: Constraint) {
        self.cons.push(cons);
    }

    pub fn add_objective(&mut self, coef: f64, var: VarId) {
        self.objective.push((coef, var));
    }

    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id.0 as usize]
    }

    pub fn var_by_name(&self, name: &str) -> Option<VarId> {
        self.vars
            .iter()
            .position(|v| v.name == name)
            .map(|i| VarId(i as u32))
    }

    pub fn count_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn count_constraints(&self) -> usize {
        self.cons.len()
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.cons
    }

    pub fn set_solution(&mut self, values: Vec<f64>) {
        debug_assert_eq!(values.len(), self.vars.len());
        self.solution = Some(values);
    }

    /// Value of a variable after solving.
    pub fn value_of(&self, id: VarId) -> Option<f64> {
        self.solution.as_ref().map(|s| s[id.0 as usize])
    }

    /// Value of the objective function under the current solution.
    pub fn objective_value(&self) -> Option<f64> {
        let sol = self.solution.as_ref()?;
        Some(
            self.objective
                .iter()
                .map(|&(c, v)| c * sol[v.0 as usize])
                .sum(),
        )
    }

    /// Serialize in LP format: `max: …;` first, then one line per
    /// constraint, then the integer declarations.
    pub fn dump_lp(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "max: {};", self.expr(&self.objective))?;
        for (i, c) in self.cons.iter().enumerate() {
            let label = if c.label.is_empty() {
                format!("c{}", i)
            } else {
                sanitize(&c.label, i)
            };
            writeln!(
                out,
                "{}: {} {} {};",
                label,
                self.expr(&c.terms),
                c.comp.symbol(),
                fmt_num(c.rhs)
            )?;
        }
        let ints: Vec<&str> = self
            .vars
            .iter()
            .filter(|v| v.kind != VarKind::Real)
            .map(|v| v.name.as_str())
            .collect();
        if !ints.is_empty() {
            writeln!(out, "int {};", ints.join(", "))?;
        }
        Ok(())
    }

    pub fn dump_lp_string(&self) -> String {
        let mut buf = Vec::new();
        self.dump_lp(&mut buf).expect("write to memory");
        String::from_utf8(buf).expect("LP dump is ASCII")
    }

    fn expr(&self, terms: &[(f64, VarId)]) -> String {
        if terms.is_empty() {
            return "0".to_string();
        }
        let mut s = String::new();
        for (i, &(coef, var)) in terms.iter().enumerate() {
            let name = &self.vars[var.0 as usize].name;
            if i == 0 {
                if coef < 0.0 {
                    s.push_str("- ");
                }
            } else if coef < 0.0 {
                s.push_str(" - ");
            } else {
                s.push_str(" + ");
            }
            let _ = write!(s, "{} {}", fmt_num(coef.abs()), name);
        }
        s
    }

    /// Parse a system back from its LP dump.
    pub fn parse_lp(text: &str) -> Result<IlpSystem> {
        let mut sys = IlpSystem::new();
        let mut by_name: HashMap<String, VarId> = HashMap::new();
        let mut intern = |sys: &mut IlpSystem, name: &str| -> VarId {
            if let Some(&id) = by_name.get(name) {
                return id;
            }
            let id = sys.new_var(Some(name.to_string()), VarKind::Real);
            by_name.insert(name.to_string(), id);
            id
        };

        for stmt in text.split(';') {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            if let Some(rest) = stmt.strip_prefix("int ") {
                for name in rest.split(',') {
                    let id = intern(&mut sys, name.trim());
                    sys.vars[id.0 as usize].kind = VarKind::Int;
                }
                continue;
            }
            let (label, body) = stmt.split_once(':').ok_or_else(|| {
                AnalysisError::Configuration(format!("LP statement without label: '{}'", stmt))
            })?;
            let label = label.trim();
            if label == "max" {
                sys.objective = parse_terms(&mut sys, &mut intern, body)?;
                continue;
            }
            let (op_pos, comp) = ["<=", ">=", "="]
                .iter()
                .find_map(|op| body.find(op).map(|p| (p, *op)))
                .ok_or_else(|| {
                    AnalysisError::Configuration(format!("LP constraint without comparator: '{}'", stmt))
                })?;
            let comp_val = match comp {
                "<=" => Comp::Le,
                ">=" => Comp::Ge,
                _ => Comp::Eq,
            };
            let lhs = &body[..op_pos];
            let rhs: f64 = body[op_pos + comp.len()..].trim().parse().map_err(|_| {
                AnalysisError::Configuration(format!("bad LP constant in '{}'", stmt))
            })?;
            let mut cons = Constraint::new(label, comp_val, rhs);
            cons.terms = parse_terms(&mut sys, &mut intern, lhs)?;
            sys.add(cons);
        }
        Ok(sys)
    }
}

fn parse_terms(
    sys: &mut IlpSystem,
    intern: &mut impl FnMut(&mut IlpSystem, &str) -> VarId,
    text: &str,
) -> Result<Vec<(f64, VarId)>> {
    let mut terms = Vec::new();
    let mut sign = 1.0;
    let mut coef: Option<f64> = None;
    for tok in text.split_whitespace() {
        match tok {
            "+" => sign = 1.0,
            "-" => sign = -1.0,
            "0" if coef.is_none() && terms.is_empty() && text.trim() == "0" => {}
            _ => {
                if let Ok(n) = tok.parse::<f64>() {
                    coef = Some(n);
                } else {
                    let id = intern(sys, tok);
                    terms.push((sign * coef.take().unwrap_or(1.0), id));
                    sign = 1.0;
                }
            }
        }
    }
    Ok(terms)
}

fn fmt_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn sanitize(label: &str, idx: usize) -> String {
    let mut s: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    s.truncate(48);
    format!("{}_{}", s, idx)
}

/// The external solver facade.
pub trait Solver {
    fn name(&self) -> &str;
    /// Maximize the system's objective; store the variable values in the
    /// system and return the objective value.
    fn solve(&self, sys: &mut IlpSystem) -> Result<f64>;
}

/// Facade over an external `lp_solve` process.
pub struct LpSolve {
    path: std::path::PathBuf,
}

impl LpSolve {
    /// Locate `lp_solve` on the PATH.
    pub fn find() -> Result<LpSolve> {
        let path = which::which("lp_solve")
            .map_err(|_| AnalysisError::Solver("no lp_solve binary on PATH".to_string()))?;
        Ok(LpSolve { path })
    }
}

impl Solver for LpSolve {
    fn name(&self) -> &str {
        "lp_solve"
    }

    fn solve(&self, sys: &mut IlpSystem) -> Result<f64> {
        let file = std::env::temp_dir().join(format!("timebound-{}.lp", std::process::id()));
        {
            let mut f = std::fs::File::create(&file)?;
            sys.dump_lp(&mut f)?;
        }
        let output = std::process::Command::new(&self.path)
            .arg(&file)
            .output()
            .map_err(|e| AnalysisError::Solver(format!("cannot run lp_solve: {}", e)))?;
        let _ = std::fs::remove_file(&file);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success()
            || stdout.contains("infeasible")
            || stdout.contains("unbounded")
        {
            return Err(AnalysisError::Solver(format!(
                "lp_solve failed: {}",
                stdout.lines().next().unwrap_or("no output")
            )));
        }

        let mut objective = None;
        let mut values = vec![0.0; sys.count_vars()];
        let mut in_vars = false;
        for line in stdout.lines() {
            if let Some(v) = line.strip_prefix("Value of objective function:") {
                objective = v.trim().parse::<f64>().ok();
            } else if line.starts_with("Actual values of the variables") {
                in_vars = true;
            } else if in_vars {
                let mut it = line.split_whitespace();
                if let (Some(name), Some(value)) = (it.next(), it.next()) {
                    if let (Some(id), Ok(v)) = (sys.var_by_name(name), value.parse::<f64>()) {
                        values[id.0 as usize] = v;
                    }
                }
            }
        }
        let objective = objective
            .ok_or_else(|| AnalysisError::Solver("lp_solve printed no objective".to_string()))?;
        sys.set_solution(values);
        Ok(objective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IlpSystem {
        let mut sys = IlpSystem::new();
        let x = sys.new_var(Some("x_entry".into()), VarKind::Int);
        let y = sys.new_var(Some("x_body".into()), VarKind::Int);
        let mut c0 = Constraint::new("entry", Comp::Eq, 1.0);
        c0.add_lhs(1.0, x);
        sys.add(c0);
        let mut c1 = Constraint::new("loop bound", Comp::Le, 0.0);
        c1.add_lhs(1.0, y).add_rhs(10.0, x);
        sys.add(c1);
        sys.add_objective(5.0, x);
        sys.add_objective(7.0, y);
        sys
    }

    #[test]
    fn test_dump_shape() {
        let sys = sample();
        let dump = sys.dump_lp_string();
        let mut lines = dump.lines();
        assert_eq!(lines.next(), Some("max: 5 x_entry + 7 x_body;"));
        assert_eq!(lines.next(), Some("entry_0: 1 x_entry = 1;"));
        assert_eq!(lines.next(), Some("loop_bound_1: 1 x_body - 10 x_entry <= 0;"));
        assert_eq!(lines.next(), Some("int x_entry, x_body;"));
    }

    #[test]
    fn test_lp_round_trip() {
        let sys = sample();
        let dump = sys.dump_lp_string();
        let back = IlpSystem::parse_lp(&dump).unwrap();
        assert_eq!(back.count_vars(), sys.count_vars());
        assert_eq!(back.count_constraints(), sys.count_constraints());
        for (a, b) in back.constraints().iter().zip(sys.constraints()) {
            assert_eq!(a.comp, b.comp);
            assert_eq!(a.rhs, b.rhs);
            // variable identity survives by name order
            let norm = |c: &Constraint| {
                let mut t = c.terms.clone();
                t.sort_by_key(|&(_, v)| v.0);
                t
            };
            assert_eq!(norm(a), norm(b));
        }
        assert_eq!(back.objective, sys.objective);
    }

    #[test]
    fn test_solution_accessors() {
        let mut sys = sample();
        sys.set_solution(vec![1.0, 10.0]);
        assert_eq!(sys.value_of(VarId(0)), Some(1.0));
        assert_eq!(sys.objective_value(), Some(75.0));
    }
}
