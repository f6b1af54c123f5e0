use super::{roster_fingerprint, Grade, PromotionPlan, RosterByGrade, TransitionError};
use std::collections::{BTreeMap, HashSet};

/// Partitions the active roster into next-grade promotions and the graduating cohort.
///
/// Students keep their input order inside each output list, so two calls on the
/// same roster produce identical plans.
pub fn plan(
    roster_by_grade: &RosterByGrade,
    grade_sequence: &[Grade],
    current_year: &str,
    new_year: &str,
) -> Result<PromotionPlan, TransitionError> {
    if grade_sequence.len() < 2 {
        return Err(TransitionError::validation(
            "grade sequence needs at least two grades to promote into",
        ));
    }
    let mut seen: HashSet<&Grade> = HashSet::new();
    for g in grade_sequence {
        if !seen.insert(g) {
            return Err(TransitionError::validation(format!(
                "grade {} appears twice in the grade sequence",
                g
            )));
        }
    }
    for (grade, students) in roster_by_grade {
        if !students.is_empty() && !seen.contains(grade) {
            return Err(TransitionError::validation(format!(
                "{} active student(s) are in grade {}, which is not in the grade sequence",
                students.len(),
                grade
            )));
        }
    }
    if current_year.trim() == new_year.trim() {
        return Err(TransitionError::validation(
            "new academic year must differ from the current one",
        ));
    }

    let mut promotions: BTreeMap<Grade, Vec<_>> = grade_sequence[1..]
        .iter()
        .map(|g| (g.clone(), Vec::new()))
        .collect();
    let mut graduating = Vec::new();

    let last = grade_sequence.len() - 1;
    for (idx, grade) in grade_sequence.iter().enumerate() {
        let Some(students) = roster_by_grade.get(grade) else {
            continue;
        };
        if idx == last {
            graduating.extend(students.iter().cloned());
        } else if let Some(bucket) = promotions.get_mut(&grade_sequence[idx + 1]) {
            bucket.extend(students.iter().cloned());
        }
    }

    Ok(PromotionPlan {
        current_year: current_year.trim().to_string(),
        new_year: new_year.trim().to_string(),
        grade_sequence: grade_sequence.to_vec(),
        promotions,
        graduating,
        roster_fingerprint: roster_fingerprint(roster_by_grade),
    })
}
