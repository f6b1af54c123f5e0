use crate::config;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    fn query(e: rusqlite::Error) -> Self {
        Self {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }

    fn insert(e: rusqlite::Error, table: &str) -> Self {
        Self {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": table })),
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Year filter from params, falling back to the configured current year.
fn year_param(conn: &Connection, params: &serde_json::Value) -> Result<Option<String>, HandlerErr> {
    if let Some(y) = params.get("academicYear").and_then(|v| v.as_str()) {
        return Ok(Some(y.trim().to_string()));
    }
    config::load_current_year(conn).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn section_grade(conn: &Connection, section_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT grade FROM sections WHERE id = ?",
        [section_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn next_sort_order(conn: &Connection) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students",
        [],
        |r| r.get(0),
    )
    .map_err(HandlerErr::query)
}

fn sections_list(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let year = year_param(conn, &req.params)?;
    // Correlated subqueries keep counts independent of each other.
    let mut stmt = conn
        .prepare(
            "SELECT
               sec.id,
               sec.grade,
               sec.academic_year,
               sec.label,
               (SELECT COUNT(*) FROM students s WHERE s.section_id = sec.id AND s.active = 1)
             FROM sections sec
             WHERE ?1 IS NULL OR sec.academic_year = ?1
             ORDER BY sec.academic_year, sec.grade, sec.label",
        )
        .map_err(HandlerErr::query)?;
    let sections = stmt
        .query_map([year.as_deref()], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "grade": r.get::<_, String>(1)?,
                "academicYear": r.get::<_, String>(2)?,
                "label": r.get::<_, String>(3)?,
                "studentCount": r.get::<_, i64>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "academicYear": year, "sections": sections }))
}

fn sections_create(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let grade = get_required_str(&req.params, "grade")?;
    let Some(year) = year_param(conn, &req.params)? else {
        return Err(HandlerErr::bad_params(
            "missing academicYear and no current year is configured",
        ));
    };
    let label = match req.params.get("label").and_then(|v| v.as_str()) {
        Some(l) if !l.trim().is_empty() => l.trim().to_string(),
        _ => format!("{}A", grade),
    };
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sections(id, grade, academic_year, label, created_at) VALUES(?, ?, ?, ?, ?)",
        (&id, &grade, &year, &label, now()),
    )
    .map_err(|e| HandlerErr::insert(e, "sections"))?;
    Ok(json!({ "sectionId": id, "grade": grade, "academicYear": year, "label": label }))
}

fn students_list(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let section_id = req.params.get("sectionId").and_then(|v| v.as_str());
    let include_inactive = req
        .params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.full_name, s.section_id, sec.label, sec.grade, s.intake_grade, s.active
             FROM students s
             LEFT JOIN sections sec ON sec.id = s.section_id
             WHERE (?1 IS NULL OR s.section_id = ?1) AND (?2 = 1 OR s.active = 1)
             ORDER BY s.full_name COLLATE NOCASE, s.id",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map((section_id, include_inactive as i64), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "fullName": r.get::<_, String>(1)?,
                "sectionId": r.get::<_, Option<String>>(2)?,
                "sectionLabel": r.get::<_, Option<String>>(3)?,
                "grade": r.get::<_, Option<String>>(4)?,
                "intakeGrade": r.get::<_, Option<String>>(5)?,
                "active": r.get::<_, i64>(6)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "students": students }))
}

fn students_create(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let full_name = get_required_str(&req.params, "fullName")?;
    let section_id = get_required_str(&req.params, "sectionId")?;
    if section_grade(conn, &section_id)?.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "section not found".into(),
            details: Some(json!({ "sectionId": section_id })),
        });
    }
    let id = Uuid::new_v4().to_string();
    let sort_order = next_sort_order(conn)?;
    conn.execute(
        "INSERT INTO students(id, full_name, section_id, intake_grade, active, sort_order, updated_at)
         VALUES(?, ?, ?, NULL, 1, ?, ?)",
        (&id, &full_name, &section_id, sort_order, now()),
    )
    .map_err(|e| HandlerErr::insert(e, "students"))?;
    Ok(json!({ "studentId": id, "fullName": full_name, "sectionId": section_id }))
}

/// New enrollment that waits for the next transition to be placed into a section.
fn students_enroll(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let full_name = get_required_str(&req.params, "fullName")?;
    let intake_grade = get_required_str(&req.params, "intakeGrade")?;
    let grades = config::load_grades(conn).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    if !grades.sequence.iter().any(|g| g.as_str() == intake_grade) {
        return Err(HandlerErr::bad_params(format!(
            "intakeGrade {} is not in the grade sequence",
            intake_grade
        )));
    }
    let id = Uuid::new_v4().to_string();
    let sort_order = next_sort_order(conn)?;
    conn.execute(
        "INSERT INTO students(id, full_name, section_id, intake_grade, active, sort_order, updated_at)
         VALUES(?, ?, NULL, ?, 1, ?, ?)",
        (&id, &full_name, &intake_grade, sort_order, now()),
    )
    .map_err(|e| HandlerErr::insert(e, "students"))?;
    Ok(json!({ "studentId": id, "fullName": full_name, "intakeGrade": intake_grade }))
}

fn assignments_list(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let year = year_param(conn, &req.params)?;
    let mut stmt = conn
        .prepare(
            "SELECT ta.id, ta.teacher_name, ta.subject, ta.section_id, sec.label, ta.academic_year
             FROM teacher_assignments ta
             JOIN sections sec ON sec.id = ta.section_id
             WHERE ?1 IS NULL OR ta.academic_year = ?1
             ORDER BY sec.label, ta.subject, ta.teacher_name",
        )
        .map_err(HandlerErr::query)?;
    let assignments = stmt
        .query_map([year.as_deref()], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "teacherName": r.get::<_, String>(1)?,
                "subject": r.get::<_, String>(2)?,
                "sectionId": r.get::<_, String>(3)?,
                "sectionLabel": r.get::<_, String>(4)?,
                "academicYear": r.get::<_, String>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "academicYear": year, "assignments": assignments }))
}

fn assignments_create(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let teacher_name = get_required_str(&req.params, "teacherName")?;
    let subject = get_required_str(&req.params, "subject")?;
    let section_id = get_required_str(&req.params, "sectionId")?;
    let year: Option<String> = conn
        .query_row(
            "SELECT academic_year FROM sections WHERE id = ?",
            [&section_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some(year) = year else {
        return Err(HandlerErr {
            code: "not_found",
            message: "section not found".into(),
            details: Some(json!({ "sectionId": section_id })),
        });
    };
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teacher_assignments(id, teacher_name, subject, section_id, academic_year, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &teacher_name, &subject, &section_id, &year, now()),
    )
    .map_err(|e| HandlerErr::insert(e, "teacher_assignments"))?;
    Ok(json!({ "assignmentId": id, "academicYear": year }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: fn(&Connection, &Request) -> Result<serde_json::Value, HandlerErr> =
        match req.method.as_str() {
            "sections.list" => sections_list,
            "sections.create" => sections_create,
            "students.list" => students_list,
            "students.create" => students_create,
            "students.enroll" => students_enroll,
            "assignments.list" => assignments_list,
            "assignments.create" => assignments_create,
            _ => return None,
        };
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(match handler(conn, req) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
