//! Academic-year transition engine.
//!
//! `planner` partitions the active roster into promotions and graduates,
//! `capacity` sizes and fills the new sections, and `executor` applies an
//! accepted plan to a [`store::RosterStore`]. Only the executor touches a store.

pub mod capacity;
pub mod error;
pub mod executor;
pub mod planner;
pub mod store;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

pub use capacity::SimulationResult;
pub use error::{ExecutionStep, PersistenceError, TransitionError};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Grade(pub String);

impl Grade {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub full_name: String,
    pub current_section_id: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub grade: Grade,
    pub academic_year: String,
    pub label: String,
}

/// A section the executor asks the store to create (or find) for the new year.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionSpec {
    pub grade: Grade,
    pub academic_year: String,
    pub label: String,
}

pub type RosterByGrade = BTreeMap<Grade, Vec<Student>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionPlan {
    pub current_year: String,
    pub new_year: String,
    pub grade_sequence: Vec<Grade>,
    /// Keyed by the grade the students move into.
    pub promotions: BTreeMap<Grade, Vec<Student>>,
    pub graduating: Vec<Student>,
    pub roster_fingerprint: String,
}

impl PromotionPlan {
    pub fn entry_grade(&self) -> &Grade {
        &self.grade_sequence[0]
    }

    pub fn graduating_grade(&self) -> &Grade {
        &self.grade_sequence[self.grade_sequence.len() - 1]
    }

    pub fn promoted_count(&self) -> usize {
        self.promotions.values().map(Vec::len).sum()
    }

    pub fn total_students(&self) -> usize {
        self.promoted_count() + self.graduating.len()
    }
}

/// SHA-256 over students grouped by grade, in order. Plans carry it for the
/// active roster and simulations also for the pending enrollments, so an edit
/// after preview or simulation is detected before anything is mutated.
pub fn roster_fingerprint(roster: &RosterByGrade) -> String {
    let mut hasher = Sha256::new();
    for (grade, students) in roster {
        hasher.update(b"G");
        hasher.update(grade.as_str().as_bytes());
        hasher.update([0u8]);
        for s in students {
            hasher.update(s.id.as_bytes());
            hasher.update([0u8]);
            hasher.update(s.current_section_id.as_deref().unwrap_or("").as_bytes());
            hasher.update([0u8]);
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Lifecycle of one rollover.
///
/// `Confirmed` and `Executing` only exist while the executor runs; callers
/// observe them through logging and the notification sink.
#[derive(Debug, Clone, Default)]
pub enum TransitionState {
    #[default]
    Draft,
    Previewed {
        plan: PromotionPlan,
    },
    Simulated {
        plan: PromotionPlan,
        simulation: SimulationResult,
    },
    Confirmed {
        plan: PromotionPlan,
        simulation: Option<SimulationResult>,
    },
    Executing {
        plan: PromotionPlan,
        simulation: Option<SimulationResult>,
    },
    Committed {
        summary: executor::CommitSummary,
    },
    Failed {
        plan: PromotionPlan,
        error: TransitionError,
    },
}

impl TransitionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Previewed { .. } => "previewed",
            Self::Simulated { .. } => "simulated",
            Self::Confirmed { .. } => "confirmed",
            Self::Executing { .. } => "executing",
            Self::Committed { .. } => "committed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn plan(&self) -> Option<&PromotionPlan> {
        match self {
            Self::Previewed { plan }
            | Self::Simulated { plan, .. }
            | Self::Confirmed { plan, .. }
            | Self::Executing { plan, .. }
            | Self::Failed { plan, .. } => Some(plan),
            Self::Draft | Self::Committed { .. } => None,
        }
    }

    pub fn simulation(&self) -> Option<&SimulationResult> {
        match self {
            Self::Simulated { simulation, .. } => Some(simulation),
            Self::Confirmed { simulation, .. } | Self::Executing { simulation, .. } => {
                simulation.as_ref()
            }
            _ => None,
        }
    }

    /// Installs a fresh plan. Any earlier plan or simulation is discarded.
    pub fn preview(self, plan: PromotionPlan) -> Result<Self, TransitionError> {
        match self {
            Self::Failed { .. } => Err(TransitionError::validation(
                "a failed transition must be acknowledged before planning again",
            )),
            Self::Confirmed { .. } | Self::Executing { .. } => Err(TransitionError::validation(
                "a transition is already executing",
            )),
            _ => {
                tracing::info!(
                    current_year = %plan.current_year,
                    new_year = %plan.new_year,
                    promoted = plan.promoted_count(),
                    graduating = plan.graduating.len(),
                    "transition previewed"
                );
                Ok(Self::Previewed { plan })
            }
        }
    }

    /// Attaches a simulation to the current plan.
    pub fn simulate(self, simulation: SimulationResult) -> Result<Self, TransitionError> {
        match self {
            Self::Previewed { plan } | Self::Simulated { plan, .. } => {
                if simulation.roster_fingerprint != plan.roster_fingerprint {
                    return Err(TransitionError::validation(
                        "simulation was computed for a different plan",
                    ));
                }
                tracing::info!(
                    new_year = %plan.new_year,
                    valid = simulation.is_valid,
                    warnings = simulation.warnings.len(),
                    "transition simulated"
                );
                Ok(Self::Simulated { plan, simulation })
            }
            other => Err(TransitionError::validation(format!(
                "cannot simulate from state {}; preview first",
                other.name()
            ))),
        }
    }

    pub(crate) fn begin_execution(self) -> Self {
        match self {
            Self::Confirmed { plan, simulation } => Self::Executing { plan, simulation },
            other => other,
        }
    }

    pub(crate) fn fail(self, error: TransitionError) -> Self {
        match self {
            Self::Previewed { plan }
            | Self::Simulated { plan, .. }
            | Self::Confirmed { plan, .. }
            | Self::Executing { plan, .. }
            | Self::Failed { plan, .. } => Self::Failed { plan, error },
            other => other,
        }
    }

    /// Clears a plan, or a `Failed` state after the operator repaired the store.
    pub fn reset(self, acknowledge_failure: bool) -> Result<Self, TransitionError> {
        match self {
            Self::Failed { .. } if !acknowledge_failure => Err(TransitionError::validation(
                "transition failed; repair the workspace and acknowledge the failure to reset",
            )),
            Self::Confirmed { .. } | Self::Executing { .. } => Err(TransitionError::validation(
                "a transition is already executing",
            )),
            _ => Ok(Self::Draft),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn sample_plan() -> PromotionPlan {
        let roster = roster(&[("7", 3), ("8", 2), ("9", 1)]);
        planner::plan(&roster, &grades(&["7", "8", "9"]), "2024/2025", "2025/2026")
            .expect("plan")
    }

    #[test]
    fn fingerprint_changes_when_a_student_moves() {
        let a = roster(&[("7", 3), ("8", 2)]);
        let mut b = a.clone();
        assert_eq!(roster_fingerprint(&a), roster_fingerprint(&b));
        b.get_mut(&Grade::new("8"))
            .expect("grade 8")
            .push(student("x", "8B"));
        assert_ne!(roster_fingerprint(&a), roster_fingerprint(&b));
    }

    #[test]
    fn simulate_requires_preview() {
        let sim = capacity::simulate(
            &sample_plan(),
            &BTreeMap::new(),
            &crate::config::CapacityThresholds::default(),
        );
        let err = TransitionState::Draft.simulate(sim).expect_err("draft cannot simulate");
        assert!(matches!(err, TransitionError::Validation(_)));
    }

    #[test]
    fn simulation_for_another_plan_is_rejected() {
        let plan = sample_plan();
        let mut sim = capacity::simulate(
            &plan,
            &BTreeMap::new(),
            &crate::config::CapacityThresholds::default(),
        );
        sim.roster_fingerprint = "stale".into();
        let state = TransitionState::Draft.preview(plan).expect("preview");
        assert!(state.simulate(sim).is_err());
    }

    #[test]
    fn failed_state_needs_acknowledgement() {
        let state = TransitionState::Failed {
            plan: sample_plan(),
            error: TransitionError::validation("boom"),
        };
        let state = match state.clone().reset(false) {
            Ok(_) => panic!("reset without acknowledgement must fail"),
            Err(_) => state,
        };
        assert!(state.clone().preview(sample_plan()).is_err());
        assert!(matches!(state.reset(true), Ok(TransitionState::Draft)));
    }
}
