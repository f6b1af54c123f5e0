mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{error_code, request, request_ok, spawn_sidecar, temp_dir};

struct Seeded {
    section_8a: String,
}

fn create_section(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    grade: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "sections.create",
        json!({ "grade": grade, "academicYear": "2024/2025" }),
    );
    created
        .get("sectionId")
        .and_then(|v| v.as_str())
        .expect("sectionId")
        .to_string()
}

/// 7A: 3 students, 8A: 2, 9A: 2, plus two grade-7 enrollments and one assignment.
fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seeded {
    let _ = request_ok(
        stdin,
        reader,
        "seed-year",
        "setup.update",
        json!({ "section": "academicYear", "patch": { "currentYear": "2024/2025" } }),
    );
    let s7 = create_section(stdin, reader, "seed-7", "7");
    let s8 = create_section(stdin, reader, "seed-8", "8");
    let s9 = create_section(stdin, reader, "seed-9", "9");

    let roster = [
        (&s7, "Ava"),
        (&s7, "Ben"),
        (&s7, "Cleo"),
        (&s8, "Dan"),
        (&s8, "Eve"),
        (&s9, "Finn"),
        (&s9, "Gus"),
    ];
    for (i, (section, name)) in roster.iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("seed-student-{}", i),
            "students.create",
            json!({ "fullName": name, "sectionId": section }),
        );
    }
    for (i, name) in ["Hana", "Ivo"].iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("seed-enroll-{}", i),
            "students.enroll",
            json!({ "fullName": name, "intakeGrade": "7" }),
        );
    }
    let _ = request_ok(
        stdin,
        reader,
        "seed-assignment",
        "assignments.create",
        json!({ "teacherName": "Ms Park", "subject": "Math", "sectionId": s8 }),
    );
    Seeded { section_8a: s8 }
}

#[test]
fn simulated_transition_commits_the_new_year() {
    let workspace = temp_dir("rollcall-transition-flow");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed(&mut stdin, &mut reader);

    let preview = request_ok(&mut stdin, &mut reader, "2", "transition.preview", json!({}));
    assert_eq!(preview.get("state").and_then(|v| v.as_str()), Some("previewed"));
    assert_eq!(
        preview.pointer("/plan/newYear").and_then(|v| v.as_str()),
        Some("2025/2026")
    );
    assert_eq!(
        preview.pointer("/plan/promotedCount").and_then(|v| v.as_u64()),
        Some(5)
    );
    assert_eq!(
        preview.pointer("/plan/graduatingCount").and_then(|v| v.as_u64()),
        Some(2)
    );
    assert_eq!(
        preview.pointer("/plan/promotionsByGrade/8").and_then(|v| v.as_u64()),
        Some(3)
    );

    let sim = request_ok(&mut stdin, &mut reader, "3", "transition.simulate", json!({}));
    assert_eq!(sim.get("state").and_then(|v| v.as_str()), Some("simulated"));
    let sections = sim
        .pointer("/simulation/sections")
        .and_then(|v| v.as_array())
        .expect("simulated sections");
    let labels: Vec<&str> = sections
        .iter()
        .filter_map(|s| s.get("sectionLabel").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(labels, vec!["7A", "8A", "9A"]);
    assert_eq!(
        sim.pointer("/simulation/isValid").and_then(|v| v.as_bool()),
        Some(true)
    );

    let wrong = request(
        &mut stdin,
        &mut reader,
        "4",
        "transition.execute",
        json!({ "confirmYear": "2024/2025" }),
    );
    assert_eq!(error_code(&wrong), Some("confirmation_declined"));
    assert_eq!(
        wrong.pointer("/error/details/state").and_then(|v| v.as_str()),
        Some("simulated")
    );

    let backup_path = workspace.join("before-rollover.zip");
    let done = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "transition.execute",
        json!({
            "confirmYear": "2025/2026",
            "backupPath": backup_path.to_string_lossy()
        }),
    );
    assert_eq!(done.get("state").and_then(|v| v.as_str()), Some("committed"));
    assert_eq!(
        done.pointer("/summary/graduated").and_then(|v| v.as_u64()),
        Some(2)
    );
    assert_eq!(
        done.pointer("/summary/placedEnrollments").and_then(|v| v.as_u64()),
        Some(2)
    );
    assert!(backup_path.is_file());

    let setup = request_ok(&mut stdin, &mut reader, "6", "setup.get", json!({}));
    assert_eq!(
        setup
            .pointer("/academicYear/currentYear")
            .and_then(|v| v.as_str()),
        Some("2025/2026")
    );

    let listed = request_ok(&mut stdin, &mut reader, "7", "sections.list", json!({}));
    let counts: Vec<(String, i64)> = listed
        .get("sections")
        .and_then(|v| v.as_array())
        .expect("sections")
        .iter()
        .map(|s| {
            (
                s.get("label").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                s.get("studentCount").and_then(|v| v.as_i64()).unwrap_or(-1),
            )
        })
        .collect();
    assert_eq!(
        counts,
        vec![
            ("7A".to_string(), 2),
            ("8A".to_string(), 3),
            ("9A".to_string(), 2)
        ]
    );

    let old_8a = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.list",
        json!({ "sectionId": seeded.section_8a }),
    );
    assert_eq!(
        old_8a.get("students").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.list",
        json!({ "includeInactive": true }),
    );
    let inactive: Vec<&str> = all
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students")
        .iter()
        .filter(|s| s.get("active").and_then(|v| v.as_bool()) == Some(false))
        .filter_map(|s| s.get("fullName").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(inactive, vec!["Finn", "Gus"]);

    let old_assignments = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "assignments.list",
        json!({ "academicYear": "2024/2025" }),
    );
    assert_eq!(
        old_assignments
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    let history = request_ok(&mut stdin, &mut reader, "11", "transition.history", json!({}));
    let outcomes: Vec<&str> = history
        .get("entries")
        .and_then(|v| v.as_array())
        .expect("entries")
        .iter()
        .filter_map(|e| e.get("outcome").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(outcomes, vec!["committed", "declined"]);
}

#[test]
fn roster_edit_after_preview_forces_a_new_preview() {
    let workspace = temp_dir("rollcall-transition-stale");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed(&mut stdin, &mut reader);

    let _ = request_ok(&mut stdin, &mut reader, "2", "transition.preview", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "fullName": "Late Arrival", "sectionId": seeded.section_8a }),
    );

    let stale = request(
        &mut stdin,
        &mut reader,
        "4",
        "transition.execute",
        json!({ "confirmYear": "2025/2026" }),
    );
    assert_eq!(error_code(&stale), Some("validation_failed"));
    assert_eq!(
        stale.pointer("/error/details/state").and_then(|v| v.as_str()),
        Some("draft")
    );

    let setup = request_ok(&mut stdin, &mut reader, "5", "setup.get", json!({}));
    assert_eq!(
        setup
            .pointer("/academicYear/currentYear")
            .and_then(|v| v.as_str()),
        Some("2024/2025")
    );
}

#[test]
fn execute_and_simulate_need_a_preview() {
    let workspace = temp_dir("rollcall-transition-order");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let no_year = request(&mut stdin, &mut reader, "2", "transition.preview", json!({}));
    assert_eq!(error_code(&no_year), Some("validation_failed"));

    let sim = request(&mut stdin, &mut reader, "3", "transition.simulate", json!({}));
    assert_eq!(error_code(&sim), Some("validation_failed"));

    let exec = request(
        &mut stdin,
        &mut reader,
        "4",
        "transition.execute",
        json!({ "confirmYear": "2025/2026" }),
    );
    assert_eq!(error_code(&exec), Some("validation_failed"));

    let missing = request(&mut stdin, &mut reader, "5", "transition.execute", json!({}));
    assert_eq!(error_code(&missing), Some("bad_params"));

    let status = request_ok(&mut stdin, &mut reader, "6", "transition.status", json!({}));
    assert_eq!(status.get("state").and_then(|v| v.as_str()), Some("draft"));

    let reset = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "transition.reset",
        json!({ "acknowledgeFailure": false }),
    );
    assert_eq!(reset.get("state").and_then(|v| v.as_str()), Some("draft"));
}

#[test]
fn unsimulated_transition_creates_one_section_per_promoted_grade() {
    let workspace = temp_dir("rollcall-transition-plain");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = seed(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "transition.preview",
        json!({ "newYear": "2025/2026" }),
    );
    let done = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "transition.execute",
        json!({ "confirmYear": " 2025/2026 " }),
    );
    let labels: Vec<&str> = done
        .pointer("/summary/sections")
        .and_then(|v| v.as_array())
        .expect("sections")
        .iter()
        .filter_map(|s| s.get("label").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(labels, vec!["8A", "9A"]);
    assert_eq!(
        done.pointer("/summary/placedEnrollments").and_then(|v| v.as_u64()),
        Some(0)
    );

    // Enrollments wait for a simulated transition.
    let pending = request_ok(&mut stdin, &mut reader, "4", "students.list", json!({}));
    let unplaced = pending
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students")
        .iter()
        .filter(|s| s.get("sectionId").map(|v| v.is_null()) == Some(true))
        .count();
    assert_eq!(unplaced, 2);
}

#[test]
fn enrollment_after_simulation_forces_a_new_simulation() {
    let workspace = temp_dir("rollcall-transition-late-enroll");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = seed(&mut stdin, &mut reader);

    let _ = request_ok(&mut stdin, &mut reader, "2", "transition.preview", json!({}));
    let _ = request_ok(&mut stdin, &mut reader, "3", "transition.simulate", json!({}));
    let late = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.enroll",
        json!({ "fullName": "Jude", "intakeGrade": "7" }),
    );
    let late_id = late
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let stale = request(
        &mut stdin,
        &mut reader,
        "5",
        "transition.execute",
        json!({ "confirmYear": "2025/2026" }),
    );
    assert_eq!(error_code(&stale), Some("validation_failed"));
    assert_eq!(
        stale.pointer("/error/details/state").and_then(|v| v.as_str()),
        Some("previewed")
    );

    let setup = request_ok(&mut stdin, &mut reader, "6", "setup.get", json!({}));
    assert_eq!(
        setup
            .pointer("/academicYear/currentYear")
            .and_then(|v| v.as_str()),
        Some("2024/2025")
    );
    let all = request_ok(&mut stdin, &mut reader, "7", "students.list", json!({}));
    let jude = all
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students")
        .iter()
        .find(|s| s.get("id").and_then(|v| v.as_str()) == Some(late_id.as_str()))
        .cloned()
        .expect("late enrollment listed");
    assert!(jude.get("sectionId").map(|v| v.is_null()).unwrap_or(false));

    let _ = request_ok(&mut stdin, &mut reader, "8", "transition.simulate", json!({}));
    let done = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "transition.execute",
        json!({ "confirmYear": "2025/2026" }),
    );
    assert_eq!(
        done.pointer("/summary/placedEnrollments").and_then(|v| v.as_u64()),
        Some(3)
    );
}

#[test]
fn declined_confirmation_writes_no_backup() {
    let workspace = temp_dir("rollcall-transition-declined-backup");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = seed(&mut stdin, &mut reader);
    let _ = request_ok(&mut stdin, &mut reader, "2", "transition.preview", json!({}));

    let backup_path = workspace.join("declined.zip");
    let declined = request(
        &mut stdin,
        &mut reader,
        "3",
        "transition.execute",
        json!({
            "confirmYear": "2026/2027",
            "backupPath": backup_path.to_string_lossy()
        }),
    );
    assert_eq!(error_code(&declined), Some("confirmation_declined"));
    assert_eq!(
        declined.pointer("/error/details/state").and_then(|v| v.as_str()),
        Some("previewed")
    );
    assert!(!backup_path.exists());

    let history = request_ok(&mut stdin, &mut reader, "4", "transition.history", json!({}));
    let outcomes: Vec<&str> = history
        .get("entries")
        .and_then(|v| v.as_array())
        .expect("entries")
        .iter()
        .filter_map(|e| e.get("outcome").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(outcomes, vec!["declined"]);
}
