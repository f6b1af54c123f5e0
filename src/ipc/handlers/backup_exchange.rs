use crate::backup;
use crate::config;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};

/// Shared with `transition.execute`, which writes a bundle before mutating.
pub(crate) fn export_current_workspace(
    state: &AppState,
    out: &Path,
) -> anyhow::Result<backup::ExportSummary> {
    let Some(workspace) = state.workspace.as_ref() else {
        return Err(anyhow::anyhow!("no workspace selected"));
    };
    let mut year = None;
    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
        year = config::load_current_year(conn)?;
    }
    backup::export_workspace_bundle(workspace, out, year.as_deref())
}

fn handle_backup_export_workspace(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    if state.workspace.is_none() {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    }

    let out = PathBuf::from(&out_path);
    let export = match export_current_workspace(state, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };

    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspace" => Some(handle_backup_export_workspace(state, req)),
        _ => None,
    }
}
