//! Human and JSON renderings of executor reports.

use serde_json::{json, Value};

use snapsync_core::lock::{LockProbe, LockRecord};
use snapsync_core::sync::plan::{PlanSummary, SyncAction};
use snapsync_core::transaction::RecoveryOutcome;
use snapsync_core::transfer::format_bytes;
use snapsync_core::{StatusReport, SyncReport};

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

pub fn summary_line(summary: &PlanSummary) -> String {
    let parts: Vec<String> = [
        (summary.uploads, "upload"),
        (summary.downloads, "download"),
        (summary.local_deletes, "local delete"),
        (summary.remote_deletes, "remote delete"),
        (summary.restores, "restore"),
        (summary.conflicts, "conflict"),
    ]
    .into_iter()
    .filter(|(n, _)| *n > 0)
    .map(|(n, word)| plural(n, word))
    .collect();

    if parts.is_empty() {
        "up to date".to_string()
    } else {
        parts.join(", ")
    }
}

fn describe_holder(record: &LockRecord) -> String {
    format!(
        "{}@{} ({}, pid {}, since {})",
        record.user_id,
        record.hostname,
        record.operation,
        record.pid,
        record.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

fn describe_lock(lock: Option<&LockProbe>) -> String {
    match lock {
        None => "unknown".to_string(),
        Some(LockProbe::Free) => "free".to_string(),
        Some(LockProbe::Held(record)) => format!("held by {}", describe_holder(record)),
        Some(LockProbe::Stale(record)) => format!("stale, left by {}", describe_holder(record)),
    }
}

fn describe_recovery(outcome: &RecoveryOutcome) -> Option<String> {
    match outcome {
        RecoveryOutcome::Clean => None,
        RecoveryOutcome::RolledForward(id) => {
            Some(format!("Completed interrupted transaction {id}"))
        }
        RecoveryOutcome::RolledBack(id) => Some(format!("Rolled back interrupted transaction {id}")),
    }
}

pub fn status_text(report: &StatusReport) -> String {
    let mut lines = vec![
        format!(
            "Remote snapshot: {}",
            report.remote_snapshot.as_deref().unwrap_or("none")
        ),
        format!(
            "Cached snapshot: {}",
            report.cached_snapshot.as_deref().unwrap_or("none")
        ),
        format!("Lock: {}", describe_lock(report.lock.as_ref())),
    ];
    if let Some(id) = &report.pending_transaction {
        lines.push(format!(
            "Interrupted transaction {id} is pending; run `snapsync recover`"
        ));
    }
    if !report.warnings.is_empty() {
        lines.push(format!("{}:", plural(report.warnings.len(), "name warning")));
        lines.extend(report.warnings.iter().map(|w| format!("  {w}")));
    }

    let changes: Vec<String> = report
        .plan
        .items
        .iter()
        .filter(|item| item.action != SyncAction::NoOp)
        .map(|item| format!("  {:<14} {}  ({})", item.action.to_string(), item.path, item.state))
        .collect();
    if !changes.is_empty() {
        lines.push("Changes:".to_string());
        lines.extend(changes);
    }
    lines.push(summary_line(&report.plan.summary()));
    if report.ignored > 0 {
        lines.push(format!("{} ignored", plural(report.ignored, "path")));
    }
    lines.join("\n")
}

pub fn status_json(report: &StatusReport) -> Value {
    let summary = report.plan.summary();
    let lock = match &report.lock {
        None => Value::Null,
        Some(LockProbe::Free) => json!({ "state": "free" }),
        Some(LockProbe::Held(record)) => json!({ "state": "held", "holder": record }),
        Some(LockProbe::Stale(record)) => json!({ "state": "stale", "holder": record }),
    };
    let items: Vec<Value> = report
        .plan
        .items
        .iter()
        .map(|item| {
            json!({
                "path": item.path,
                "state": item.state.describe(),
                "action": item.action.to_string(),
            })
        })
        .collect();

    json!({
        "remote_snapshot": report.remote_snapshot,
        "cached_snapshot": report.cached_snapshot,
        "pending_transaction": report.pending_transaction.as_ref().map(|id| id.to_string()),
        "lock": lock,
        "warnings": report.warnings.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
        "ignored": report.ignored,
        "summary": {
            "uploads": summary.uploads,
            "downloads": summary.downloads,
            "local_deletes": summary.local_deletes,
            "remote_deletes": summary.remote_deletes,
            "restores": summary.restores,
            "conflicts": summary.conflicts,
            "unchanged": summary.unchanged,
        },
        "items": items,
    })
}

pub fn sync_text(report: &SyncReport) -> String {
    let mut lines = Vec::new();
    if let Some(line) = report.recovered.as_ref().and_then(describe_recovery) {
        lines.push(line);
    }
    for (from, to) in &report.renamed {
        lines.push(format!("Renamed {from} -> {to}"));
    }
    match (&report.transaction, &report.snapshot_id) {
        (Some(txn), snapshot) => {
            lines.push(format!(
                "Committed snapshot {} ({})",
                snapshot.as_deref().unwrap_or("?"),
                summary_line(&report.summary)
            ));
            lines.push(format!(
                "Transferred {} in {} over {:.1}s (transaction {})",
                plural(txn.files_transferred, "file"),
                format_bytes(txn.bytes_transferred),
                txn.elapsed.as_secs_f64(),
                txn.transaction_id
            ));
        }
        (None, Some(snapshot)) => lines.push(format!("Up to date at snapshot {snapshot}")),
        (None, None) => lines.push("Up to date".to_string()),
    }
    lines.join("\n")
}

pub fn recovery_text(outcome: &RecoveryOutcome) -> String {
    describe_recovery(outcome).unwrap_or_else(|| "Nothing to recover".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapsync_core::manifest::{FileEntry, Manifest};
    use snapsync_core::sync::SyncPlan;
    use snapsync_core::transaction::TransactionId;

    fn report() -> StatusReport {
        let mut local = Manifest::new();
        local.insert(FileEntry::file("new.txt", 3, 10, None)).unwrap();
        local.insert(FileEntry::file("same.txt", 3, 10, None)).unwrap();
        let mut synced = Manifest::new();
        synced.insert(FileEntry::file("same.txt", 3, 10, None)).unwrap();

        StatusReport {
            plan: SyncPlan::build(&local, &synced, &synced),
            warnings: Vec::new(),
            ignored: 0,
            remote_snapshot: Some("s1".into()),
            cached_snapshot: Some("s1".into()),
            pending_transaction: None,
            lock: Some(LockProbe::Free),
        }
    }

    #[test]
    fn summary_lists_only_nonzero_counts() {
        let summary = PlanSummary {
            uploads: 2,
            remote_deletes: 1,
            ..PlanSummary::default()
        };
        assert_eq!(summary_line(&summary), "2 uploads, 1 remote delete");
        assert_eq!(summary_line(&PlanSummary::default()), "up to date");
    }

    #[test]
    fn status_text_lists_changes_only() {
        let text = status_text(&report());
        assert!(text.contains("Remote snapshot: s1"));
        assert!(text.contains("Lock: free"));
        assert!(text.contains("new.txt"));
        assert!(!text.contains("same.txt"));
        assert!(text.ends_with("1 upload"));
    }

    #[test]
    fn status_json_carries_every_item() {
        let mut status = report();
        status.pending_transaction = Some(TransactionId::from("t9"));
        let value = status_json(&status);
        assert_eq!(value["summary"]["uploads"], 1);
        assert_eq!(value["summary"]["unchanged"], 1);
        assert_eq!(value["items"].as_array().map(Vec::len), Some(2));
        assert_eq!(value["pending_transaction"], "t9");
        assert_eq!(value["lock"]["state"], "free");
    }

    #[test]
    fn recovery_text_names_the_transaction() {
        let text = recovery_text(&RecoveryOutcome::RolledBack(TransactionId::from("t1")));
        assert_eq!(text, "Rolled back interrupted transaction t1");
        assert_eq!(recovery_text(&RecoveryOutcome::Clean), "Nothing to recover");
    }
}
