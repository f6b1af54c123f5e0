use super::{Grade, PersistenceError, RosterByGrade, SectionSpec, Student};
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Persistence collaborator of the executor. Each call is one blocking round trip.
pub trait RosterStore {
    /// Placed, active students grouped by the grade of their section, in
    /// roster order (name, then id).
    fn active_students_by_grade(&self) -> Result<RosterByGrade, PersistenceError>;

    /// Active students without a section, grouped by intake grade.
    fn pending_enrollments(&self) -> Result<BTreeMap<Grade, Vec<Student>>, PersistenceError>;

    /// Creates the sections that do not exist yet. An existing section with the
    /// same year and label is returned instead of inserting a duplicate.
    fn create_sections(
        &mut self,
        specs: &[SectionSpec],
    ) -> Result<BTreeMap<SectionSpec, String>, PersistenceError>;

    fn bulk_reassign_students(
        &mut self,
        student_ids: &[String],
        section_id: &str,
    ) -> Result<(), PersistenceError>;

    fn bulk_deactivate_students(&mut self, student_ids: &[String]) -> Result<(), PersistenceError>;

    fn delete_assignments_for_year(&mut self, year: &str) -> Result<(), PersistenceError>;

    fn upsert_setting(&mut self, key: &str, value: &str) -> Result<(), PersistenceError>;
}

/// `RosterStore` over the workspace database. Atomicity comes from the caller:
/// hand it a `Transaction` (it derefs to `Connection`) and commit or roll back
/// once the executor returns.
pub struct SqliteRosterStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteRosterStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    fn query_students(
        &self,
        sql: &str,
    ) -> Result<BTreeMap<Grade, Vec<Student>>, PersistenceError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |r| {
                let grade: String = r.get(0)?;
                Ok((
                    Grade::new(grade),
                    Student {
                        id: r.get(1)?,
                        full_name: r.get(2)?,
                        current_section_id: r.get(3)?,
                        is_active: r.get::<_, i64>(4)? != 0,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out: BTreeMap<Grade, Vec<Student>> = BTreeMap::new();
        for (grade, student) in rows {
            out.entry(grade).or_default().push(student);
        }
        Ok(out)
    }
}

impl RosterStore for SqliteRosterStore<'_> {
    fn active_students_by_grade(&self) -> Result<RosterByGrade, PersistenceError> {
        self.query_students(
            "SELECT sec.grade, s.id, s.full_name, s.section_id, s.active
             FROM students s
             JOIN sections sec ON sec.id = s.section_id
             WHERE s.active = 1
             ORDER BY sec.grade, s.full_name COLLATE NOCASE, s.id",
        )
    }

    fn pending_enrollments(&self) -> Result<BTreeMap<Grade, Vec<Student>>, PersistenceError> {
        self.query_students(
            "SELECT s.intake_grade, s.id, s.full_name, s.section_id, s.active
             FROM students s
             WHERE s.active = 1 AND s.section_id IS NULL AND s.intake_grade IS NOT NULL
             ORDER BY s.intake_grade, s.full_name COLLATE NOCASE, s.id",
        )
    }

    fn create_sections(
        &mut self,
        specs: &[SectionSpec],
    ) -> Result<BTreeMap<SectionSpec, String>, PersistenceError> {
        let mut out = BTreeMap::new();
        let created_at = Self::now();
        for spec in specs {
            let existing: Option<(String, String)> = self
                .conn
                .query_row(
                    "SELECT id, grade FROM sections WHERE academic_year = ? AND label = ?",
                    (&spec.academic_year, &spec.label),
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let id = match existing {
                Some((id, grade)) if grade == spec.grade.as_str() => {
                    tracing::debug!(label = %spec.label, year = %spec.academic_year, "reusing section");
                    id
                }
                Some((_, grade)) => {
                    return Err(PersistenceError::new(format!(
                        "section {} for {} already exists in grade {}",
                        spec.label, spec.academic_year, grade
                    )))
                }
                None => {
                    let id = Uuid::new_v4().to_string();
                    self.conn.execute(
                        "INSERT INTO sections(id, grade, academic_year, label, created_at)
                         VALUES(?, ?, ?, ?, ?)",
                        (
                            &id,
                            spec.grade.as_str(),
                            &spec.academic_year,
                            &spec.label,
                            &created_at,
                        ),
                    )?;
                    id
                }
            };
            out.insert(spec.clone(), id);
        }
        Ok(out)
    }

    fn bulk_reassign_students(
        &mut self,
        student_ids: &[String],
        section_id: &str,
    ) -> Result<(), PersistenceError> {
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM sections WHERE id = ?", [section_id], |r| {
                r.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(PersistenceError::new(format!(
                "section {} not found",
                section_id
            )));
        }
        let updated_at = Self::now();
        let mut stmt = self.conn.prepare(
            "UPDATE students
             SET section_id = ?, intake_grade = NULL, updated_at = ?
             WHERE id = ? AND active = 1",
        )?;
        let mut changed = 0usize;
        for id in student_ids {
            changed += stmt.execute((section_id, &updated_at, id))?;
        }
        if changed != student_ids.len() {
            return Err(PersistenceError::new(format!(
                "{} of {} students could not be moved (missing or inactive)",
                student_ids.len() - changed,
                student_ids.len()
            )));
        }
        Ok(())
    }

    fn bulk_deactivate_students(&mut self, student_ids: &[String]) -> Result<(), PersistenceError> {
        let updated_at = Self::now();
        let mut stmt = self
            .conn
            .prepare("UPDATE students SET active = 0, updated_at = ? WHERE id = ?")?;
        let mut changed = 0usize;
        for id in student_ids {
            changed += stmt.execute((&updated_at, id))?;
        }
        if changed != student_ids.len() {
            return Err(PersistenceError::new(format!(
                "{} of {} students were not found",
                student_ids.len() - changed,
                student_ids.len()
            )));
        }
        Ok(())
    }

    fn delete_assignments_for_year(&mut self, year: &str) -> Result<(), PersistenceError> {
        let n = self.conn.execute(
            "DELETE FROM teacher_assignments WHERE academic_year = ?",
            [year],
        )?;
        tracing::debug!(year, removed = n, "teacher assignments cleared");
        Ok(())
    }

    fn upsert_setting(&mut self, key: &str, value: &str) -> Result<(), PersistenceError> {
        crate::db::settings_set_json(self.conn, key, &serde_json::Value::String(value.into()))
            .map_err(|e| PersistenceError::new(e.to_string()))
    }
}
