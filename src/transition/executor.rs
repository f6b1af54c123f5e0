use super::capacity::{section_label, SimulationResult};
use super::store::RosterStore;
use super::{
    roster_fingerprint, ExecutionStep, PersistenceError, PromotionPlan, Section, SectionSpec,
    TransitionError, TransitionState,
};
use crate::config::CURRENT_YEAR_KEY;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Human gate in front of the first mutation. Returning `false` leaves the store untouched.
pub trait ConfirmationProvider {
    fn confirm(&mut self, message: &str) -> bool;
}

impl<F: FnMut(&str) -> bool> ConfirmationProvider for F {
    fn confirm(&mut self, message: &str) -> bool {
        self(message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Notice {
    Info,
    Warning,
    Error,
}

/// Best-effort operator notifications.
pub trait NotificationSink {
    fn notify(&mut self, message: &str, severity: Notice);
}

/// Forwards notifications to the log.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&mut self, message: &str, severity: Notice) {
        match severity {
            Notice::Info => tracing::info!("{}", message),
            Notice::Warning => tracing::warn!("{}", message),
            Notice::Error => tracing::error!("{}", message),
        }
    }
}

/// Keeps notifications so the caller can hand them back to the UI.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub messages: Vec<(Notice, String)>,
}

impl NotificationSink for CollectingSink {
    fn notify(&mut self, message: &str, severity: Notice) {
        TracingSink.notify(message, severity);
        self.messages.push((severity, message.to_string()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    pub from_year: String,
    pub to_year: String,
    pub sections: Vec<Section>,
    pub graduated: usize,
    pub promoted: usize,
    pub placed_enrollments: usize,
}

pub struct ExecutionOutcome {
    pub state: TransitionState,
    pub result: Result<CommitSummary, TransitionError>,
}

pub struct TransitionExecutor<'a, S, C, N> {
    store: &'a mut S,
    confirm: &'a mut C,
    notify: &'a mut N,
}

impl<'a, S, C, N> TransitionExecutor<'a, S, C, N>
where
    S: RosterStore,
    C: ConfirmationProvider,
    N: NotificationSink,
{
    pub fn new(store: &'a mut S, confirm: &'a mut C, notify: &'a mut N) -> Self {
        Self {
            store,
            confirm,
            notify,
        }
    }

    /// Runs the five steps against the store in order. A failing step stops the
    /// run; steps already applied stay applied and are reported in the error.
    pub fn execute(&mut self, state: TransitionState) -> ExecutionOutcome {
        let (plan, simulation) = match state {
            TransitionState::Previewed { plan } => (plan, None),
            TransitionState::Simulated { plan, simulation } => (plan, Some(simulation)),
            other => {
                let msg = format!("cannot execute from state {}; preview first", other.name());
                return ExecutionOutcome {
                    state: other,
                    result: Err(TransitionError::validation(msg)),
                };
            }
        };

        if let Some(sim) = simulation.as_ref() {
            if let Err(e) = check_distribution(&plan, sim) {
                return ExecutionOutcome {
                    state: restore(plan, simulation),
                    result: Err(e),
                };
            }
        }

        match self.store.active_students_by_grade() {
            Ok(roster) if roster_fingerprint(&roster) == plan.roster_fingerprint => {}
            Ok(_) => {
                self.notify.notify(
                    "The roster changed since the preview; preview the transition again",
                    Notice::Warning,
                );
                return ExecutionOutcome {
                    state: TransitionState::Draft,
                    result: Err(TransitionError::validation(
                        "roster changed since preview; preview again",
                    )),
                };
            }
            Err(e) => {
                return ExecutionOutcome {
                    state: restore(plan, simulation),
                    result: Err(TransitionError::validation(format!(
                        "could not verify roster: {}",
                        e
                    ))),
                };
            }
        }

        if let Some(sim) = simulation.as_ref() {
            match self.store.pending_enrollments() {
                Ok(pending) if roster_fingerprint(&pending) == sim.incoming_fingerprint => {}
                Ok(_) => {
                    self.notify.notify(
                        "Enrollments changed since the simulation; simulate the transition again",
                        Notice::Warning,
                    );
                    return ExecutionOutcome {
                        state: TransitionState::Previewed { plan },
                        result: Err(TransitionError::validation(
                            "pending enrollments changed since simulation; simulate again",
                        )),
                    };
                }
                Err(e) => {
                    return ExecutionOutcome {
                        state: restore(plan, simulation),
                        result: Err(TransitionError::validation(format!(
                            "could not verify enrollments: {}",
                            e
                        ))),
                    };
                }
            }
        }

        let message = confirmation_message(&plan, simulation.as_ref());
        if !self.confirm.confirm(&message) {
            self.notify.notify(
                &format!("Transition to {} was not confirmed", plan.new_year),
                Notice::Warning,
            );
            return ExecutionOutcome {
                state: restore(plan, simulation),
                result: Err(TransitionError::Declined),
            };
        }
        tracing::info!(new_year = %plan.new_year, "transition confirmed");
        let executing = TransitionState::Confirmed { plan, simulation }.begin_execution();
        tracing::info!(state = executing.name(), "transition executing");

        match self.run_steps(&executing) {
            Ok(summary) => {
                self.notify.notify(
                    &format!(
                        "Academic year {} committed: {} promoted, {} graduated, {} section(s)",
                        summary.to_year,
                        summary.promoted,
                        summary.graduated,
                        summary.sections.len()
                    ),
                    Notice::Info,
                );
                ExecutionOutcome {
                    state: TransitionState::Committed {
                        summary: summary.clone(),
                    },
                    result: Ok(summary),
                }
            }
            Err(error) => {
                self.notify
                    .notify(&format!("Transition failed at {}", error), Notice::Error);
                ExecutionOutcome {
                    state: executing.fail(error.clone()),
                    result: Err(error),
                }
            }
        }
    }

    fn run_steps(&mut self, executing: &TransitionState) -> Result<CommitSummary, TransitionError> {
        let (Some(plan), simulation) = (executing.plan(), executing.simulation()) else {
            return Err(TransitionError::validation("no plan to execute"));
        };
        let mut applied: Vec<ExecutionStep> = Vec::new();

        // 1. create sections
        let specs = section_specs(plan, simulation);
        let step = ExecutionStep::CreateSections;
        tracing::info!(%step, count = specs.len(), "running");
        let ids = self
            .store
            .create_sections(&specs)
            .map_err(|e| step_failed(step, &applied, &[], e))?;
        applied.push(step);

        // 2. graduate
        let step = ExecutionStep::Graduate;
        let graduating: Vec<String> = plan.graduating.iter().map(|s| s.id.clone()).collect();
        tracing::info!(%step, count = graduating.len(), "running");
        self.store
            .bulk_deactivate_students(&graduating)
            .map_err(|e| step_failed(step, &applied, &[], e))?;
        applied.push(step);

        // 3. promote
        let step = ExecutionStep::Promote;
        let moves = reassignments(plan, simulation);
        let mut moved = 0usize;
        let mut moved_sections: Vec<String> = Vec::new();
        for (spec, student_ids) in &moves {
            let Some(section_id) = ids.get(spec) else {
                return Err(step_failed(
                    step,
                    &applied,
                    &moved_sections,
                    PersistenceError::new(format!("no section id returned for {}", spec.label)),
                ));
            };
            tracing::info!(%step, section = %spec.label, count = student_ids.len(), "running");
            self.store
                .bulk_reassign_students(student_ids, section_id)
                .map_err(|e| step_failed(step, &applied, &moved_sections, e))?;
            moved += student_ids.len();
            moved_sections.push(spec.label.clone());
        }
        applied.push(step);

        // 4. reset assignments
        let step = ExecutionStep::ResetAssignments;
        tracing::info!(%step, year = %plan.current_year, "running");
        self.store
            .delete_assignments_for_year(&plan.current_year)
            .map_err(|e| step_failed(step, &applied, &[], e))?;
        applied.push(step);

        // 5. commit year
        let step = ExecutionStep::CommitYear;
        tracing::info!(%step, new_year = %plan.new_year, "running");
        self.store
            .upsert_setting(CURRENT_YEAR_KEY, &plan.new_year)
            .map_err(|e| step_failed(step, &applied, &[], e))?;

        let promoted = plan.promoted_count();
        Ok(CommitSummary {
            from_year: plan.current_year.clone(),
            to_year: plan.new_year.clone(),
            sections: specs
                .iter()
                .filter_map(|spec| {
                    ids.get(spec).map(|id| Section {
                        id: id.clone(),
                        grade: spec.grade.clone(),
                        academic_year: spec.academic_year.clone(),
                        label: spec.label.clone(),
                    })
                })
                .collect(),
            graduated: graduating.len(),
            promoted,
            placed_enrollments: moved.saturating_sub(promoted),
        })
    }
}

fn restore(plan: PromotionPlan, simulation: Option<SimulationResult>) -> TransitionState {
    match simulation {
        Some(simulation) => TransitionState::Simulated { plan, simulation },
        None => TransitionState::Previewed { plan },
    }
}

fn step_failed(
    step: ExecutionStep,
    applied: &[ExecutionStep],
    moved_sections: &[String],
    cause: PersistenceError,
) -> TransitionError {
    tracing::error!(
        %step,
        applied = applied.len(),
        moved_sections = moved_sections.len(),
        error = %cause,
        "transition step failed"
    );
    if applied.is_empty() && moved_sections.is_empty() {
        TransitionError::Persistence { step, cause }
    } else {
        TransitionError::PartialExecution {
            failed_step: step,
            applied: applied.to_vec(),
            moved_sections: moved_sections.to_vec(),
            cause,
        }
    }
}

fn confirmation_message(plan: &PromotionPlan, simulation: Option<&SimulationResult>) -> String {
    let mut msg = format!(
        "Move to academic year {} (from {}): promote {} student(s), graduate {}",
        plan.new_year,
        plan.current_year,
        plan.promoted_count(),
        plan.graduating.len()
    );
    if let Some(sim) = simulation {
        msg.push_str(&format!(
            ", create {} section(s), {} warning(s)",
            sim.sections.len(),
            sim.warnings.len()
        ));
    }
    msg.push_str(". This cannot be undone.");
    msg
}

/// Without a simulation every promoted grade gets one section; with one, every
/// simulated section is created, including the entry grade.
fn section_specs(plan: &PromotionPlan, simulation: Option<&SimulationResult>) -> Vec<SectionSpec> {
    match simulation {
        Some(sim) => sim
            .sections
            .iter()
            .map(|s| SectionSpec {
                grade: s.grade.clone(),
                academic_year: plan.new_year.clone(),
                label: s.section_label.clone(),
            })
            .collect(),
        None => plan
            .grade_sequence
            .iter()
            .filter(|g| plan.promotions.contains_key(*g))
            .map(|g| SectionSpec {
                grade: g.clone(),
                academic_year: plan.new_year.clone(),
                label: section_label(g, 0),
            })
            .collect(),
    }
}

fn reassignments(
    plan: &PromotionPlan,
    simulation: Option<&SimulationResult>,
) -> Vec<(SectionSpec, Vec<String>)> {
    let specs = section_specs(plan, simulation);
    match simulation {
        Some(sim) => specs
            .into_iter()
            .zip(sim.sections.iter())
            .filter(|(_, s)| !s.student_ids.is_empty())
            .map(|(spec, s)| (spec, s.student_ids.clone()))
            .collect(),
        None => specs
            .into_iter()
            .filter_map(|spec| {
                let ids: Vec<String> = plan
                    .promotions
                    .get(&spec.grade)?
                    .iter()
                    .map(|s| s.id.clone())
                    .collect();
                (!ids.is_empty()).then_some((spec, ids))
            })
            .collect(),
    }
}

/// A simulation must place every promoted student exactly once, in the grade
/// the plan promotes them into, and never place a graduate.
fn check_distribution(plan: &PromotionPlan, sim: &SimulationResult) -> Result<(), TransitionError> {
    if sim.roster_fingerprint != plan.roster_fingerprint || sim.new_year != plan.new_year {
        return Err(TransitionError::validation(
            "simulation was computed for a different plan; simulate again",
        ));
    }
    let mut placed: BTreeMap<&str, &str> = BTreeMap::new();
    for section in &sim.sections {
        for id in &section.student_ids {
            if placed.insert(id.as_str(), section.grade.as_str()).is_some() {
                return Err(TransitionError::validation(format!(
                    "student {} is placed in more than one section",
                    id
                )));
            }
        }
    }
    for (grade, students) in &plan.promotions {
        for s in students {
            match placed.get(s.id.as_str()) {
                Some(g) if *g == grade.as_str() => {}
                Some(g) => {
                    return Err(TransitionError::validation(format!(
                        "student {} is placed in grade {} instead of {}",
                        s.id, g, grade
                    )))
                }
                None => {
                    return Err(TransitionError::validation(format!(
                        "student {} is not placed in any section",
                        s.id
                    )))
                }
            }
        }
    }
    let graduating: HashSet<&str> = plan.graduating.iter().map(|s| s.id.as_str()).collect();
    if let Some(id) = placed.keys().find(|id| graduating.contains(*id)) {
        return Err(TransitionError::validation(format!(
            "graduating student {} is placed in a section",
            id
        )));
    }
    Ok(())
}
