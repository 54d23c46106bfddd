use super::{Lit, SatSolver, SatStats, SolveBudget, SolveResult, VarId};
use std::time::Instant;
use varisat::{ExtendFormula, Solver};

/// [SatSolver] over the varisat CDCL solver.
///
/// varisat supports incremental clause addition and assumptions, which is
/// all the engines rely on. It does not expose search counters or a
/// conflict limit, so those stats stay zero, conflict budgets are ignored,
/// and the wall-clock deadline is checked at solve entry.
pub struct VarisatSolver {
    solver: Solver<'static>,
    budget: SolveBudget,
    stats: SatStats,
}

impl VarisatSolver {
    pub fn new() -> VarisatSolver {
        VarisatSolver {
            solver: Solver::new(),
            budget: SolveBudget::default(),
            stats: SatStats::default(),
        }
    }

    fn to_backend(lit: Lit) -> varisat::Lit {
        let var = varisat::Var::from_index(lit.var().idx as usize);
        let pos = varisat::Lit::positive(var);
        if lit.is_neg() {
            !pos
        } else {
            pos
        }
    }
}

impl Default for VarisatSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SatSolver for VarisatSolver {
    fn new_var(&mut self) -> VarId {
        let var = self.solver.new_var();
        self.stats.vars += 1;
        VarId::new(var.index() as u32)
    }

    fn add_clause(&mut self, lits: &[Lit]) {
        let mapped: Vec<varisat::Lit> = lits.iter().map(|&l| Self::to_backend(l)).collect();
        self.solver.add_clause(&mapped);
        self.stats.clauses += 1;
        self.stats.clause_lits += lits.len() as u64;
    }

    fn solve(&mut self, assumptions: &[Lit], model: &mut Vec<bool>) -> SolveResult {
        if let Some(deadline) = self.budget.deadline {
            if Instant::now() >= deadline {
                return SolveResult::Aborted;
            }
        }

        let mapped: Vec<varisat::Lit> =
            assumptions.iter().map(|&l| Self::to_backend(l)).collect();
        self.solver.assume(&mapped);

        match self.solver.solve() {
            Ok(true) => {
                model.clear();
                model.resize(self.stats.vars as usize, false);
                if let Some(assignment) = self.solver.model() {
                    for lit in assignment {
                        let idx = lit.var().index();
                        if idx < model.len() {
                            model[idx] = lit.is_positive();
                        }
                    }
                }
                SolveResult::Sat
            }
            Ok(false) => SolveResult::Unsat,
            Err(_) => SolveResult::Aborted,
        }
    }

    fn stats(&self) -> SatStats {
        self.stats
    }

    fn forget_learnt(&mut self) {
        // varisat manages its clause database internally.
    }

    fn set_budget(&mut self, budget: SolveBudget) {
        self.budget = budget;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_trivial() {
        let mut s = VarisatSolver::new();
        let a = s.new_var();
        let b = s.new_var();
        s.add_clause(&[Lit::pos(a), Lit::pos(b)]);
        s.add_clause(&[Lit::neg(a)]);
        let mut model = Vec::new();
        assert_eq!(s.solve(&[], &mut model), SolveResult::Sat);
        assert!(!model[a.idx as usize]);
        assert!(model[b.idx as usize]);
    }

    #[test]
    fn test_assumptions_are_per_call() {
        let mut s = VarisatSolver::new();
        let a = s.new_var();
        let mut model = Vec::new();
        assert_eq!(s.solve(&[Lit::neg(a)], &mut model), SolveResult::Sat);
        assert!(!model[a.idx as usize]);
        // Contradictory assumptions only fail that call.
        s.add_clause(&[Lit::pos(a)]);
        assert_eq!(s.solve(&[Lit::neg(a)], &mut model), SolveResult::Unsat);
        assert_eq!(s.solve(&[], &mut model), SolveResult::Sat);
        assert!(model[a.idx as usize]);
    }

    #[test]
    fn test_deadline_aborts() {
        let mut s = VarisatSolver::new();
        let a = s.new_var();
        s.add_clause(&[Lit::pos(a)]);
        s.set_budget(SolveBudget {
            deadline: Some(Instant::now() - std::time::Duration::from_secs(1)),
            ..Default::default()
        });
        let mut model = Vec::new();
        assert_eq!(s.solve(&[], &mut model), SolveResult::Aborted);
    }
}
