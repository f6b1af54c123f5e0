use crate::config::{self, AcademicYear};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::backup_exchange;
use crate::ipc::types::{AppState, Request};
use crate::transition::executor::{CollectingSink, Notice, NotificationSink, TransitionExecutor};
use crate::transition::store::{RosterStore, SqliteRosterStore};
use crate::transition::{
    capacity, planner, ExecutionStep, PersistenceError, PromotionPlan, TransitionError,
    TransitionState,
};
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

fn moved_sections(e: &TransitionError) -> &[String] {
    match e {
        TransitionError::PartialExecution { moved_sections, .. } => moved_sections,
        _ => &[],
    }
}

fn error_json(e: &TransitionError) -> serde_json::Value {
    let applied: Vec<u8> = match e {
        TransitionError::PartialExecution { applied, .. } => {
            applied.iter().map(|s| s.number()).collect()
        }
        _ => Vec::new(),
    };
    let skipped: Vec<u8> = match e.failed_step() {
        Some(failed) => ExecutionStep::ALL
            .iter()
            .filter(|s| **s > failed)
            .map(|s| s.number())
            .collect(),
        None => Vec::new(),
    };
    json!({
        "code": e.code(),
        "message": e.to_string(),
        "failedStep": e.failed_step().map(|s| s.number()),
        "appliedSteps": applied,
        "skippedSteps": skipped,
        "movedSections": moved_sections(e)
    })
}

fn transition_err(id: &str, e: &TransitionError, extra: serde_json::Value) -> serde_json::Value {
    let mut details = json!({
        "failedStep": e.failed_step().map(|s| s.number()),
        "movedSections": moved_sections(e)
    });
    if let (Some(d), Some(x)) = (details.as_object_mut(), extra.as_object()) {
        for (k, v) in x {
            d.insert(k.clone(), v.clone());
        }
    }
    err(id, e.code(), e.to_string(), Some(details))
}

fn plan_json(plan: &PromotionPlan) -> serde_json::Value {
    let promotions: serde_json::Map<String, serde_json::Value> = plan
        .promotions
        .iter()
        .map(|(g, students)| (g.to_string(), json!(students.len())))
        .collect();
    json!({
        "currentYear": plan.current_year,
        "newYear": plan.new_year,
        "gradeSequence": plan.grade_sequence,
        "totalStudents": plan.total_students(),
        "promotedCount": plan.promoted_count(),
        "graduatingGrade": plan.graduating_grade(),
        "graduatingCount": plan.graduating.len(),
        "promotionsByGrade": promotions,
        "plan": plan
    })
}

fn state_json(state: &TransitionState) -> serde_json::Value {
    let mut out = json!({ "state": state.name() });
    if let Some(plan) = state.plan() {
        out["plan"] = plan_json(plan);
    }
    if let (Some(plan), Some(sim)) = (state.plan(), state.simulation()) {
        let labels: serde_json::Map<String, serde_json::Value> = plan
            .grade_sequence
            .iter()
            .map(|g| {
                let l: Vec<&str> = sim.sections_for(g).map(|s| s.section_label.as_str()).collect();
                (g.to_string(), json!(l))
            })
            .collect();
        out["simulation"] = json!(sim);
        out["sectionLabelsByGrade"] = json!(labels);
    }
    match state {
        TransitionState::Committed { summary } => out["summary"] = json!(summary),
        TransitionState::Failed { error, .. } => out["error"] = error_json(error),
        _ => {}
    }
    out
}

fn notices_json(sink: &CollectingSink) -> serde_json::Value {
    json!(sink
        .messages
        .iter()
        .map(|(severity, message)| json!({ "severity": severity, "message": message }))
        .collect::<Vec<_>>())
}

fn write_log(
    conn: &Connection,
    from_year: &str,
    to_year: &str,
    outcome: &str,
    failed_step: Option<ExecutionStep>,
    message: Option<&str>,
) {
    let res = conn.execute(
        "INSERT INTO transition_log(id, from_year, to_year, outcome, failed_step, message, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            from_year,
            to_year,
            outcome,
            failed_step.map(|s| s.number() as i64),
            message,
            chrono::Utc::now().to_rfc3339(),
        ),
    );
    if let Err(e) = res {
        tracing::warn!(error = %e, "failed to write transition log");
    }
}

fn handle_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(&req.id, state_json(&state.transition))
}

fn handle_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let grades = match config::load_grades(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let current_year = match config::load_current_year(conn) {
        Ok(Some(y)) => y,
        Ok(None) => {
            return err(
                &req.id,
                "validation_failed",
                "current academic year is not configured",
                Some(json!({ "setting": config::CURRENT_YEAR_KEY })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let new_year = match req.params.get("newYear").and_then(|v| v.as_str()) {
        Some(raw) => match AcademicYear::parse(raw) {
            Some(y) => y.label(),
            None => return err(&req.id, "bad_params", "newYear must look like 2025/2026", None),
        },
        None => match AcademicYear::parse(&current_year) {
            Some(y) => y.next().label(),
            None => {
                return err(
                    &req.id,
                    "validation_failed",
                    format!("current academic year {} is malformed", current_year),
                    None,
                )
            }
        },
    };

    let store = SqliteRosterStore::new(conn);
    let roster = match store.active_students_by_grade() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let plan = match planner::plan(&roster, &grades.sequence, &current_year, &new_year) {
        Ok(p) => p,
        Err(e) => return transition_err(&req.id, &e, json!({})),
    };
    match state.transition.clone().preview(plan) {
        Ok(next) => {
            state.transition = next;
            ok(&req.id, state_json(&state.transition))
        }
        Err(e) => transition_err(&req.id, &e, json!({ "state": state.transition.name() })),
    }
}

fn handle_simulate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(plan) = state.transition.plan() else {
        return err(
            &req.id,
            "validation_failed",
            "preview the transition before simulating",
            Some(json!({ "state": state.transition.name() })),
        );
    };
    let thresholds = match config::load_capacity(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let pending = match SqliteRosterStore::new(conn).pending_enrollments() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let simulation = capacity::simulate(plan, &pending, &thresholds);
    match state.transition.clone().simulate(simulation) {
        Ok(next) => {
            state.transition = next;
            ok(&req.id, state_json(&state.transition))
        }
        Err(e) => transition_err(&req.id, &e, json!({ "state": state.transition.name() })),
    }
}

fn handle_execute(state: &mut AppState, req: &Request) -> serde_json::Value {
    if state.db.is_none() {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    }
    let confirm_year = match req.params.get("confirmYear").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing confirmYear", None),
    };
    if !matches!(
        state.transition,
        TransitionState::Previewed { .. } | TransitionState::Simulated { .. }
    ) {
        let e = TransitionError::validation(format!(
            "cannot execute from state {}; preview first",
            state.transition.name()
        ));
        return transition_err(&req.id, &e, json!({ "state": state.transition.name() }));
    }
    let Some(plan) = state.transition.plan().cloned() else {
        return err(&req.id, "validation_failed", "no plan to execute", None);
    };

    if confirm_year != plan.new_year {
        let e = TransitionError::Declined;
        tracing::info!(new_year = %plan.new_year, "transition not confirmed");
        let mut sink = CollectingSink::default();
        sink.notify(
            &format!("Transition to {} was not confirmed", plan.new_year),
            Notice::Warning,
        );
        if let Some(conn) = state.db.as_ref() {
            write_log(
                conn,
                &plan.current_year,
                &plan.new_year,
                "declined",
                None,
                Some(&e.to_string()),
            );
        }
        return transition_err(
            &req.id,
            &e,
            json!({
                "state": state.transition.name(),
                "rolledBack": false,
                "backupPath": serde_json::Value::Null,
                "notifications": notices_json(&sink)
            }),
        );
    }

    let mut backup_path: Option<String> = None;
    if let Some(raw) = req.params.get("backupPath").and_then(|v| v.as_str()) {
        let out = PathBuf::from(raw.trim());
        if let Err(e) = backup_exchange::export_current_workspace(state, &out) {
            return err(
                &req.id,
                "io_failed",
                format!("pre-transition backup failed: {}", e),
                Some(json!({ "path": raw })),
            );
        }
        backup_path = Some(out.to_string_lossy().to_string());
    }

    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut sink = CollectingSink::default();
    let mut confirm = |message: &str| {
        tracing::info!(prompt = message, "confirmation requested");
        confirm_year == plan.new_year
    };
    let prior = std::mem::take(&mut state.transition);
    let outcome = {
        let mut store = SqliteRosterStore::new(&tx);
        TransitionExecutor::new(&mut store, &mut confirm, &mut sink).execute(prior)
    };
    let mut next_state = outcome.state;
    let mut result = outcome.result;

    let mut rolled_back = false;
    if result.is_ok() {
        if let Err(e) = tx.commit() {
            let error = TransitionError::Persistence {
                step: ExecutionStep::CommitYear,
                cause: PersistenceError::from(e),
            };
            tracing::error!(error = %error, "transition commit failed");
            next_state = TransitionState::Failed {
                plan: plan.clone(),
                error: error.clone(),
            };
            result = Err(error);
            rolled_back = true;
        }
    } else if let Err(e) = tx.rollback() {
        tracing::error!(error = %e, "transition rollback failed");
    } else {
        rolled_back = true;
    }
    if rolled_back && matches!(next_state, TransitionState::Failed { .. }) {
        sink.messages.push((
            Notice::Info,
            "No changes were kept; the workspace database was rolled back".to_string(),
        ));
    }
    state.transition = next_state;

    let (outcome_name, failed_step, message) = match &result {
        Ok(_) => ("committed", None, None),
        Err(e @ TransitionError::Declined) => ("declined", None, Some(e.to_string())),
        Err(e @ TransitionError::Validation(_)) => ("rejected", None, Some(e.to_string())),
        Err(e) => ("failed", e.failed_step(), Some(e.to_string())),
    };
    write_log(
        conn,
        &plan.current_year,
        &plan.new_year,
        outcome_name,
        failed_step,
        message.as_deref(),
    );

    match result {
        Ok(summary) => ok(
            &req.id,
            json!({
                "state": state.transition.name(),
                "summary": summary,
                "backupPath": backup_path,
                "notifications": notices_json(&sink)
            }),
        ),
        Err(e) => transition_err(
            &req.id,
            &e,
            json!({
                "state": state.transition.name(),
                "rolledBack": rolled_back,
                "backupPath": backup_path,
                "notifications": notices_json(&sink)
            }),
        ),
    }
}

fn handle_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let acknowledge = req
        .params
        .get("acknowledgeFailure")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    match state.transition.clone().reset(acknowledge) {
        Ok(next) => {
            tracing::info!(from = state.transition.name(), "transition reset");
            state.transition = next;
            ok(&req.id, state_json(&state.transition))
        }
        Err(e) => transition_err(&req.id, &e, json!({ "state": state.transition.name() })),
    }
}

fn handle_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut stmt = match conn.prepare(
        "SELECT id, from_year, to_year, outcome, failed_step, message, created_at
         FROM transition_log
         ORDER BY created_at DESC, rowid DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "fromYear": r.get::<_, String>(1)?,
                "toYear": r.get::<_, String>(2)?,
                "outcome": r.get::<_, String>(3)?,
                "failedStep": r.get::<_, Option<i64>>(4)?,
                "message": r.get::<_, Option<String>>(5)?,
                "createdAt": r.get::<_, String>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(entries) => ok(&req.id, json!({ "entries": entries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "transition.status" => Some(handle_status(state, req)),
        "transition.preview" => Some(handle_preview(state, req)),
        "transition.simulate" => Some(handle_simulate(state, req)),
        "transition.execute" => Some(handle_execute(state, req)),
        "transition.reset" => Some(handle_reset(state, req)),
        "transition.history" => Some(handle_history(state, req)),
        _ => None,
    }
}
