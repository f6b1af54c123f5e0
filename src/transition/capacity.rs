use super::{roster_fingerprint, Grade, PromotionPlan, Student};
use crate::config::{CapacityThresholds, SECTION_LETTERS};
use serde::Serialize;
use std::collections::BTreeMap;

/// Health of a section (or of a grade's average section) against the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityStatus {
    Empty,
    Low,
    Optimal,
    Full,
    /// Over `maximum`.
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Insight {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionForecast {
    pub section_label: String,
    pub grade: Grade,
    pub student_count: usize,
    pub status: CapacityStatus,
    pub student_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeForecast {
    pub grade: Grade,
    pub section_count: usize,
    pub total_students: usize,
    pub avg_per_section: usize,
    pub target_per_section: usize,
    pub status: CapacityStatus,
    pub clamped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub new_year: String,
    pub sections: Vec<SectionForecast>,
    pub grades: Vec<GradeForecast>,
    pub warnings: Vec<Warning>,
    pub insights: Vec<Insight>,
    pub is_valid: bool,
    pub roster_fingerprint: String,
    /// Fingerprint of the pending enrollments this simulation placed.
    pub incoming_fingerprint: String,
}

impl SimulationResult {
    pub fn sections_for<'a>(&'a self, grade: &Grade) -> impl Iterator<Item = &'a SectionForecast> {
        let grade = grade.clone();
        self.sections.iter().filter(move |s| s.grade == grade)
    }
}

pub fn classify(count: usize, t: &CapacityThresholds) -> CapacityStatus {
    if count == 0 {
        CapacityStatus::Empty
    } else if count < t.minimum {
        CapacityStatus::Low
    } else if count > t.maximum {
        CapacityStatus::High
    } else if count > t.high {
        CapacityStatus::Full
    } else {
        CapacityStatus::Optimal
    }
}

pub fn section_label(grade: &Grade, index: usize) -> String {
    format!("{}{}", grade, SECTION_LETTERS[index % SECTION_LETTERS.len()])
}

pub struct CapacitySimulator<'a> {
    thresholds: &'a CapacityThresholds,
    entry_grade: &'a Grade,
}

impl<'a> CapacitySimulator<'a> {
    pub fn new(thresholds: &'a CapacityThresholds, entry_grade: &'a Grade) -> Self {
        Self {
            thresholds,
            entry_grade,
        }
    }

    /// The entry grade takes new enrollments, so it is sized for `comfortable`
    /// classes; every other grade for `optimal`.
    pub fn target_per_section(&self, grade: &Grade) -> usize {
        let target = if grade == self.entry_grade {
            self.thresholds.comfortable
        } else {
            self.thresholds.optimal
        };
        target.max(1)
    }

    fn unclamped_sections(&self, count: usize, grade: &Grade) -> usize {
        count.div_ceil(self.target_per_section(grade)).max(1)
    }

    /// Always in `1..=max_parallel_sections`; an empty grade still gets one section.
    pub fn required_sections(&self, count: usize, grade: &Grade) -> usize {
        let max = self.thresholds.max_parallel_sections.clamp(1, SECTION_LETTERS.len());
        self.unclamped_sections(count, grade).clamp(1, max)
    }

    /// Round-robin: the student at index `i` goes to section `i % section_count`.
    pub fn distribute(
        &self,
        students: &[Student],
        grade: &Grade,
        section_count: usize,
    ) -> BTreeMap<String, Vec<Student>> {
        let n = section_count.clamp(1, SECTION_LETTERS.len());
        let labels: Vec<String> = (0..n).map(|i| section_label(grade, i)).collect();
        let mut out: BTreeMap<String, Vec<Student>> =
            labels.iter().map(|l| (l.clone(), Vec::new())).collect();
        for (i, s) in students.iter().enumerate() {
            if let Some(bucket) = out.get_mut(&labels[i % n]) {
                bucket.push(s.clone());
            }
        }
        out
    }

    pub fn classify(&self, count: usize) -> CapacityStatus {
        classify(count, self.thresholds)
    }
}

/// Sizes and fills every grade of the new year. Graduates are not sectioned.
pub fn simulate(
    plan: &PromotionPlan,
    incoming_by_grade: &BTreeMap<Grade, Vec<Student>>,
    thresholds: &CapacityThresholds,
) -> SimulationResult {
    let sim = CapacitySimulator::new(thresholds, plan.entry_grade());
    let mut sections = Vec::new();
    let mut grades = Vec::new();
    let mut warnings = Vec::new();
    let mut insights = Vec::new();

    for (grade, students) in incoming_by_grade {
        if !students.is_empty() && !plan.grade_sequence.contains(grade) {
            warnings.push(Warning {
                severity: Severity::Medium,
                message: format!(
                    "{} incoming student(s) for unknown grade {} will not be placed",
                    students.len(),
                    grade
                ),
            });
        }
    }

    for grade in &plan.grade_sequence {
        let mut population: Vec<Student> =
            plan.promotions.get(grade).cloned().unwrap_or_default();
        if let Some(incoming) = incoming_by_grade.get(grade) {
            population.extend(incoming.iter().cloned());
        }
        let total = population.len();
        let section_count = sim.required_sections(total, grade);
        let clamped = sim.unclamped_sections(total, grade) > section_count;
        if clamped {
            warnings.push(Warning {
                severity: Severity::Medium,
                message: format!(
                    "Grade {} needs {} sections but at most {} are allowed",
                    grade,
                    sim.unclamped_sections(total, grade),
                    section_count
                ),
            });
        }

        for (label, members) in sim.distribute(&population, grade, section_count) {
            let count = members.len();
            let status = sim.classify(count);
            match status {
                CapacityStatus::Empty => warnings.push(Warning {
                    severity: Severity::High,
                    message: format!("Section {} has no students", label),
                }),
                CapacityStatus::High => warnings.push(Warning {
                    severity: Severity::Medium,
                    message: format!(
                        "Section {} is over capacity: {} students (maximum {})",
                        label, count, thresholds.maximum
                    ),
                }),
                CapacityStatus::Low => insights.push(Insight {
                    message: format!(
                        "Section {} is small: {} students (minimum {})",
                        label, count, thresholds.minimum
                    ),
                }),
                CapacityStatus::Full => insights.push(Insight {
                    message: format!("Section {} is nearly full: {} students", label, count),
                }),
                CapacityStatus::Optimal => {}
            }
            sections.push(SectionForecast {
                section_label: label,
                grade: grade.clone(),
                student_count: count,
                status,
                student_ids: members.into_iter().map(|s| s.id).collect(),
            });
        }

        let avg = (total as f64 / section_count as f64).round() as usize;
        let target = sim.target_per_section(grade);
        insights.push(Insight {
            message: format!(
                "Grade {}: {} students in {} section(s), about {} per section (target {})",
                grade, total, section_count, avg, target
            ),
        });
        grades.push(GradeForecast {
            grade: grade.clone(),
            section_count,
            total_students: total,
            avg_per_section: avg,
            target_per_section: target,
            status: sim.classify(avg),
            clamped,
        });
    }

    let is_valid = !warnings.iter().any(|w| w.severity == Severity::High);
    for w in &warnings {
        tracing::warn!(severity = ?w.severity, "{}", w.message);
    }

    SimulationResult {
        new_year: plan.new_year.clone(),
        sections,
        grades,
        warnings,
        insights,
        is_valid,
        roster_fingerprint: plan.roster_fingerprint.clone(),
        incoming_fingerprint: roster_fingerprint(incoming_by_grade),
    }
}

#[cfg(test)]
mod tests {
    use super::super::planner;
    use super::super::test_support::*;
    use super::*;
    use proptest::prelude::*;

    fn scenario_thresholds() -> CapacityThresholds {
        CapacityThresholds {
            minimum: 20,
            comfortable: 30,
            optimal: 35,
            high: 40,
            maximum: 45,
            max_parallel_sections: 12,
        }
    }

    fn sizes(map: &BTreeMap<String, Vec<Student>>) -> Vec<usize> {
        map.values().map(Vec::len).collect()
    }

    #[test]
    fn scenario_a_section_counts() {
        let t = scenario_thresholds();
        let entry = Grade::new("7");
        let sim = CapacitySimulator::new(&t, &entry);
        assert_eq!(sim.required_sections(90, &Grade::new("7")), 3);
        assert_eq!(sim.required_sections(60, &Grade::new("8")), 2);
        let eight = sim.distribute(&cohort("8", 60), &Grade::new("8"), 2);
        assert_eq!(sizes(&eight), vec![30, 30]);
        assert_eq!(
            eight.keys().cloned().collect::<Vec<_>>(),
            vec!["8A".to_string(), "8B".to_string()]
        );
    }

    #[test]
    fn scenario_a_full_simulation_does_not_section_graduates() {
        let roster = roster(&[("7", 60), ("8", 50), ("9", 50)]);
        let plan = planner::plan(&roster, &grades(&["7", "8", "9"]), "2024/2025", "2025/2026")
            .expect("plan");
        let mut incoming = BTreeMap::new();
        incoming.insert(Grade::new("7"), cohort("new", 90));
        let r = simulate(&plan, &incoming, &scenario_thresholds());

        let by_grade: BTreeMap<&str, &GradeForecast> =
            r.grades.iter().map(|g| (g.grade.as_str(), g)).collect();
        assert_eq!(by_grade["7"].section_count, 3);
        assert_eq!(by_grade["7"].target_per_section, 30);
        assert_eq!(by_grade["8"].section_count, 2);
        assert_eq!(by_grade["8"].total_students, 60);
        assert_eq!(by_grade["9"].total_students, 50);
        let placed: usize = r.sections.iter().map(|s| s.student_count).sum();
        assert_eq!(placed, 90 + 60 + 50);
        assert!(r
            .sections
            .iter()
            .flat_map(|s| s.student_ids.iter())
            .all(|id| !id.starts_with("9-")));
        assert!(r.is_valid);
    }

    #[test]
    fn scenario_b_empty_entry_grade_is_invalid() {
        let roster = roster(&[("7", 30), ("8", 30), ("9", 30)]);
        let plan = planner::plan(&roster, &grades(&["7", "8", "9"]), "2024/2025", "2025/2026")
            .expect("plan");
        let r = simulate(&plan, &BTreeMap::new(), &scenario_thresholds());

        let seven: Vec<_> = r.sections_for(&Grade::new("7")).collect();
        assert_eq!(seven.len(), 1);
        assert_eq!(seven[0].status, CapacityStatus::Empty);
        let high: Vec<_> = r
            .warnings
            .iter()
            .filter(|w| w.severity == Severity::High)
            .collect();
        assert_eq!(high.len(), 1);
        assert!(high[0].message.contains("7A"));
        assert!(!r.is_valid);
    }

    #[test]
    fn scenario_c_forty_six_split_evenly() {
        let t = scenario_thresholds();
        let entry = Grade::new("7");
        let sim = CapacitySimulator::new(&t, &entry);
        let g = Grade::new("8");
        assert_eq!(sim.required_sections(46, &g), 2);
        assert_eq!(sizes(&sim.distribute(&cohort("8", 46), &g, 2)), vec![23, 23]);
    }

    #[test]
    fn classify_boundaries() {
        let t = scenario_thresholds();
        assert_eq!(classify(0, &t), CapacityStatus::Empty);
        assert_eq!(classify(19, &t), CapacityStatus::Low);
        assert_eq!(classify(20, &t), CapacityStatus::Optimal);
        assert_eq!(classify(40, &t), CapacityStatus::Optimal);
        assert_eq!(classify(41, &t), CapacityStatus::Full);
        assert_eq!(classify(45, &t), CapacityStatus::Full);
        assert_eq!(classify(46, &t), CapacityStatus::High);
    }

    #[test]
    fn clamped_grade_is_over_capacity_and_warned() {
        let t = CapacityThresholds {
            max_parallel_sections: 2,
            ..scenario_thresholds()
        };
        let roster = roster(&[("7", 100), ("8", 10)]);
        let plan = planner::plan(&roster, &grades(&["7", "8"]), "2024/2025", "2025/2026")
            .expect("plan");
        let mut incoming = BTreeMap::new();
        incoming.insert(Grade::new("7"), cohort("new", 40));
        let r = simulate(&plan, &incoming, &t);

        let eight = r.grades.iter().find(|g| g.grade.as_str() == "8").expect("grade 8");
        assert_eq!(eight.section_count, 2);
        assert!(eight.clamped);
        assert_eq!(eight.status, CapacityStatus::High);
        assert!(r
            .warnings
            .iter()
            .any(|w| w.severity == Severity::Medium && w.message.contains("over capacity")));
        assert!(r.is_valid);
    }

    #[test]
    fn low_sections_are_insights_not_warnings() {
        let roster = roster(&[("7", 10), ("8", 10)]);
        let plan = planner::plan(&roster, &grades(&["7", "8"]), "2024/2025", "2025/2026")
            .expect("plan");
        let mut incoming = BTreeMap::new();
        incoming.insert(Grade::new("7"), cohort("new", 5));
        let r = simulate(&plan, &incoming, &scenario_thresholds());
        assert!(r.warnings.is_empty());
        assert!(r.insights.iter().any(|i| i.message.contains("8A is small")));
    }

    #[test]
    fn incoming_for_unknown_grade_is_warned() {
        let roster = roster(&[("7", 25)]);
        let plan = planner::plan(&roster, &grades(&["7", "8"]), "2024/2025", "2025/2026")
            .expect("plan");
        let mut incoming = BTreeMap::new();
        incoming.insert(Grade::new("7"), cohort("new", 25));
        incoming.insert(Grade::new("12"), cohort("x", 2));
        let r = simulate(&plan, &incoming, &scenario_thresholds());
        assert!(r.warnings.iter().any(|w| w.message.contains("unknown grade 12")));
    }

    proptest! {
        #[test]
        fn distribute_is_balanced_and_lossless(n in 0usize..400, sections in 1usize..=26) {
            let t = scenario_thresholds();
            let entry = Grade::new("7");
            let sim = CapacitySimulator::new(&t, &entry);
            let students = cohort("8", n);
            let out = sim.distribute(&students, &Grade::new("8"), sections);

            let s = sizes(&out);
            prop_assert_eq!(s.len(), sections);
            let max = *s.iter().max().expect("sections");
            let min = *s.iter().min().expect("sections");
            prop_assert!(max - min <= 1);

            let mut ids: Vec<String> = out.values().flatten().map(|s| s.id.clone()).collect();
            let mut expected: Vec<String> = students.iter().map(|s| s.id.clone()).collect();
            ids.sort();
            expected.sort();
            prop_assert_eq!(ids, expected);
        }

        #[test]
        fn required_sections_stays_in_bounds(count in 0usize..5000, max in 1usize..=26, entry in any::<bool>()) {
            let t = CapacityThresholds { max_parallel_sections: max, ..scenario_thresholds() };
            let entry_grade = Grade::new("7");
            let sim = CapacitySimulator::new(&t, &entry_grade);
            let grade = if entry { Grade::new("7") } else { Grade::new("8") };
            let n = sim.required_sections(count, &grade);
            prop_assert!((1..=max).contains(&n));
            prop_assert_eq!(sim.required_sections(0, &grade), 1);
        }

        #[test]
        fn classify_never_improves_past_maximum(a in 0usize..200, b in 0usize..200) {
            let t = scenario_thresholds();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            if lo > t.maximum {
                prop_assert_eq!(classify(lo, &t), CapacityStatus::High);
                prop_assert_eq!(classify(hi, &t), CapacityStatus::High);
            }
            if lo >= t.minimum {
                prop_assert!(classify(hi, &t) >= classify(lo, &t));
            }
        }
    }
}
