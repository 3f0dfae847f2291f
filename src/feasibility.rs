use serde::Serialize;

use crate::model::RunState;

/// Progress of one constraint against the current tallies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstraintProgress {
    pub attribute: String,
    pub min_count: u32,
    pub current: u32,
    pub deficit: u32,
}

impl ConstraintProgress {
    pub fn satisfied(&self) -> bool {
        self.deficit == 0
    }
}

/// A constraint that can no longer be met with the slots left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfeasibleConstraint {
    pub attribute: String,
    pub deficit: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FeasibilityReport {
    pub remaining: u32,
    pub progress: Vec<ConstraintProgress>,
    pub infeasible: Vec<InfeasibleConstraint>,
}

impl FeasibilityReport {
    pub fn is_feasible(&self) -> bool {
        self.infeasible.is_empty()
    }
}

/// Derive per-constraint feasibility from the run's tallies.
pub fn evaluate(run: &RunState) -> FeasibilityReport {
    let remaining = run.capacity_required.saturating_sub(run.admitted_count);
    let mut report = FeasibilityReport {
        remaining,
        ..Default::default()
    };

    for constraint in &run.constraints {
        let current = run
            .admitted_by_attribute
            .get(&constraint.attribute)
            .copied()
            .unwrap_or(0);
        let deficit = constraint.min_count.saturating_sub(current);

        if deficit > remaining {
            report.infeasible.push(InfeasibleConstraint {
                attribute: constraint.attribute.clone(),
                deficit,
                remaining,
            });
        }
        report.progress.push(ConstraintProgress {
            attribute: constraint.attribute.clone(),
            min_count: constraint.min_count,
            current,
            deficit,
        });
    }

    report
}
