use crate::config::{self, AcademicYear};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::transition::TransitionState;
use serde_json::{json, Map, Value};

/// Month the school year starts in; used only to suggest a year when none is configured.
const SCHOOL_YEAR_START_MONTH: u32 = 7;

#[derive(Clone, Copy)]
enum SetupSection {
    Capacity,
    Grades,
    AcademicYear,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "capacity" => Some(Self::Capacity),
            "grades" => Some(Self::Grades),
            "academicYear" => Some(Self::AcademicYear),
            _ => None,
        }
    }
}

fn academic_year_value(conn: &rusqlite::Connection) -> anyhow::Result<Value> {
    let current = config::load_current_year(conn)?;
    let suggested =
        AcademicYear::containing(chrono::Local::now().date_naive(), SCHOOL_YEAR_START_MONTH);
    let next = current
        .as_deref()
        .and_then(AcademicYear::parse)
        .map(|y| y.next().label());
    Ok(json!({
        "currentYear": current,
        "nextYear": next,
        "suggestedYear": suggested.label()
    }))
}

fn apply_academic_year_patch(
    conn: &rusqlite::Connection,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    for (k, v) in patch {
        match k.as_str() {
            "currentYear" => {
                let s = v
                    .as_str()
                    .ok_or_else(|| "currentYear must be string".to_string())?;
                let year = AcademicYear::parse(s)
                    .ok_or_else(|| "currentYear must look like 2024/2025".to_string())?;
                config::save_current_year(conn, &year.label()).map_err(|e| e.to_string())?;
            }
            _ => return Err(format!("unknown academicYear field: {}", k)),
        }
    }
    Ok(())
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let capacity = match config::load_capacity(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grades = match config::load_grades(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let academic_year = match academic_year_value(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "capacity": capacity,
            "grades": grades,
            "academicYear": academic_year
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let saved = match section {
        SetupSection::Capacity => {
            let mut current = match config::load_capacity(conn) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            if let Err(msg) = current.apply_patch(patch_obj) {
                return err(&req.id, "bad_params", msg, None);
            }
            config::save_capacity(conn, &current)
        }
        SetupSection::Grades => {
            let mut current = match config::load_grades(conn) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            if let Err(msg) = current.apply_patch(patch_obj) {
                return err(&req.id, "bad_params", msg, None);
            }
            config::save_grades(conn, &current)
        }
        SetupSection::AcademicYear => {
            if let Err(msg) = apply_academic_year_patch(conn, patch_obj) {
                return err(&req.id, "bad_params", msg, None);
            }
            Ok(())
        }
    };
    if let Err(e) = saved {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    // A plan computed under the old configuration no longer applies.
    if matches!(
        state.transition,
        TransitionState::Previewed { .. } | TransitionState::Simulated { .. }
    ) {
        tracing::info!(section = section_raw, "configuration changed; discarding plan");
        state.transition = TransitionState::Draft;
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
