use std::fs;
use std::path::Path;

use chrono::Local;
use eyre::{eyre, Result};
use serde_json::{json, Value};

use crate::cancel::CancelFlag;
use crate::client::{CommentApi, NoteApi};
use crate::input::{NoteDescriptor, NoteList};
use crate::pool::CredentialPool;
use crate::progress::ProgressManager;
use crate::retry::{call_with_rotation, CrawlFailure, FailureKind, RetryPolicy};
use crate::sink::JsonlSink;
use crate::walker::{walk_note_comments, WalkRequest, WalkerConfig};

/// Drives one task: computes the pending list, runs the per-note pipeline
/// with failure isolation, and writes the task-wide summary.
pub struct Coordinator<'a, C> {
    pub client: &'a C,
    pub pool: &'a CredentialPool,
    pub policy: &'a RetryPolicy,
    pub walker_cfg: &'a WalkerConfig,
    pub cancel: &'a CancelFlag,
    pub include_comments: bool,
    pub recheck_incomplete: bool,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub total: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_comments: u64,
    pub cancelled: bool,
}

struct NoteOutput {
    fetched: u64,
    completed: bool,
    title: String,
}

impl<'a, C: NoteApi + CommentApi + Sync> Coordinator<'a, C> {
    pub async fn run(
        &self,
        list: &NoteList,
        output_dir: &Path,
        source_reference: &str,
    ) -> Result<BatchReport> {
        let mut progress =
            ProgressManager::open(output_dir, source_reference, self.recheck_incomplete)?;
        let pending = progress.pending_notes(&list.notes)?;

        let mut report = BatchReport {
            total: list.notes.len(),
            ..BatchReport::default()
        };
        let mut succeeded_entries: Vec<Value> = Vec::new();
        let mut failed_entries: Vec<Value> = Vec::new();

        if pending.is_empty() {
            tracing::info!("all notes already completed; nothing to do");
        }

        for (i, descriptor) in pending.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let stats = progress.statistics().clone();
            tracing::info!(
                current = i + 1,
                pending = pending.len(),
                completed = stats.completed,
                failed = stats.failed,
                note_id = %descriptor.note_id,
                "processing note"
            );
            report.attempted += 1;

            match self.process_note(&mut progress, descriptor, output_dir).await {
                Ok(out) => {
                    report.succeeded += 1;
                    report.total_comments += out.fetched;
                    succeeded_entries.push(json!({
                        "note_id": descriptor.note_id,
                        "url": descriptor.note_url,
                        "title": out.title,
                        "comment_count": out.fetched,
                        "comments_completed": out.completed,
                    }));
                }
                Err(failure) if failure.kind == FailureKind::Cancelled => {
                    // State is already persisted; leave the note as-is so a
                    // rerun resumes it.
                    tracing::warn!(note_id = %descriptor.note_id, "note interrupted");
                    report.cancelled = true;
                    break;
                }
                Err(failure) => {
                    tracing::error!(note_id = %descriptor.note_id, error = %failure, "note failed");
                    report.failed += 1;
                    progress.mark_failed(&descriptor.note_id, &failure.to_string())?;
                    failed_entries.push(json!({
                        "note_id": descriptor.note_id,
                        "url": descriptor.note_url,
                        "error": failure.to_string(),
                    }));
                }
            }
        }

        self.write_summary(
            output_dir,
            source_reference,
            &report,
            succeeded_entries,
            failed_entries,
        )?;

        report.cancelled = report.cancelled || self.cancel.is_cancelled();
        tracing::info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            comments = report.total_comments,
            cancelled = report.cancelled,
            "batch finished"
        );
        Ok(report)
    }

    async fn process_note(
        &self,
        progress: &mut ProgressManager,
        descriptor: &NoteDescriptor,
        output_dir: &Path,
    ) -> Result<NoteOutput, CrawlFailure> {
        let note_id = &descriptor.note_id;
        progress
            .mark_processing(note_id, &descriptor.note_url)
            .map_err(storage)?;

        // 1) Note metadata, through the pool.
        let (mut note, lease) = call_with_rotation(
            self.pool,
            self.policy,
            self.cancel,
            "note info",
            |lease| self.client.note_info(lease, note_id, &descriptor.xsec_token),
        )
        .await?;
        note.url = descriptor.note_url.clone();
        note.crawl_time = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        if note.comment_count == 0 {
            note.comment_count = descriptor.comment_count.unwrap_or(0);
        }

        // 2) Persist the basic metadata immediately; comments can take hours.
        let basic_path = output_dir.join(format!("note_{note_id}_basic.json"));
        let basic_json =
            serde_json::to_string_pretty(&note).map_err(|e| storage(eyre!("{e}")))?;
        fs::write(&basic_path, &basic_json)
            .map_err(|e| storage(eyre!("failed to write {}: {e}", basic_path.display())))?;
        progress.set_basic_saved(note_id).map_err(storage)?;
        tracing::info!(note_id = %note_id, path = %basic_path.display(), "basic metadata saved");

        // 3) Walk the comment tree into the JSONL sink.
        let mut fetched = 0u64;
        let mut completed = true;
        if self.include_comments {
            if descriptor.xsec_token.is_empty() {
                progress
                    .record_warning(note_id, "no signed token in note url; comments skipped")
                    .map_err(storage)?;
                completed = false;
            } else {
                let (_, resumed) = progress.resume_point(note_id);
                let comments_path = output_dir.join(format!("note_{note_id}_comments.jsonl"));
                let mut sink =
                    JsonlSink::open(&comments_path, resumed > 0).map_err(storage)?;
                let request = WalkRequest {
                    note_id: note_id.clone(),
                    xsec_token: descriptor.xsec_token.clone(),
                    expected_comments: note.comment_count.max(descriptor.comment_count.unwrap_or(0)),
                };
                let outcome = walk_note_comments(
                    self.client,
                    self.pool,
                    self.policy,
                    self.walker_cfg,
                    progress,
                    &mut sink,
                    &request,
                    self.cancel,
                )
                .await;
                if let Some(failure) = outcome.failure {
                    return Err(failure);
                }
                fetched = outcome.fetched;
                completed = outcome.completed;
                log_completion(note_id, fetched, request.expected_comments);
            }
        }

        // 4) Full record: basic metadata plus what the walk actually found.
        let full_path = output_dir.join(format!("note_{note_id}_full.json"));
        let mut full = serde_json::to_value(&note).map_err(|e| storage(eyre!("{e}")))?;
        if let Some(obj) = full.as_object_mut() {
            obj.insert("comment_count".to_string(), json!(fetched));
            obj.insert(
                "comments_file".to_string(),
                json!(format!("note_{note_id}_comments.jsonl")),
            );
            obj.insert("comments_completed".to_string(), json!(completed));
        }
        let full_json =
            serde_json::to_string_pretty(&full).map_err(|e| storage(eyre!("{e}")))?;
        fs::write(&full_path, full_json)
            .map_err(|e| storage(eyre!("failed to write {}: {e}", full_path.display())))?;

        progress
            .mark_completed(note_id, fetched, self.include_comments)
            .map_err(storage)?;
        self.pool.credit_notes(&lease.fingerprint, 1);

        Ok(NoteOutput {
            fetched,
            completed,
            title: note.title,
        })
    }

    fn write_summary(
        &self,
        output_dir: &Path,
        source_reference: &str,
        report: &BatchReport,
        succeeded: Vec<Value>,
        failed: Vec<Value>,
    ) -> Result<()> {
        let summary = json!({
            "process_info": {
                "source_reference": source_reference,
                "total_notes": report.total,
                "successful_notes": report.succeeded,
                "failed_notes": report.failed,
                "total_comments": report.total_comments,
                "process_time": Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            },
            "successful_notes": succeeded,
            "failed_notes": failed,
        });
        let path = output_dir.join("summary_all_notes.json");
        let body = serde_json::to_string_pretty(&summary)
            .map_err(|e| eyre!("failed to serialize summary: {e}"))?;
        fs::write(&path, body)
            .map_err(|e| eyre!("failed to write summary {}: {e}", path.display()))?;
        tracing::info!(path = %path.display(), "summary saved");
        Ok(())
    }
}

fn storage(err: eyre::Report) -> CrawlFailure {
    CrawlFailure::new(FailureKind::Storage, err.to_string())
}

fn log_completion(note_id: &str, fetched: u64, expected: u64) {
    if expected == 0 {
        return;
    }
    let pct = fetched as f64 / expected as f64 * 100.0;
    if pct < 50.0 {
        tracing::warn!(
            note_id,
            fetched,
            expected,
            pct = format!("{pct:.1}"),
            "low comment completion; the signed token may have expired mid-walk"
        );
    } else {
        tracing::info!(note_id, fetched, expected, pct = format!("{pct:.1}"), "comment completion");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CommentPage, NoteInfo, WireComment};
    use crate::pool::{CredentialPool, Lease};
    use crate::progress::NoteStatus;
    use crate::transport::ApiOutcome;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Scripted platform: one note-info outcome per note id, one top-level
    /// comment page per (note, cursor).
    #[derive(Default)]
    struct FakePlatform {
        notes: Mutex<HashMap<String, ApiOutcome<NoteInfo>>>,
        pages: Mutex<HashMap<(String, String), ApiOutcome<CommentPage>>>,
    }

    impl FakePlatform {
        fn note(&self, id: &str, comment_count: u64) {
            self.notes.lock().unwrap().insert(
                id.to_string(),
                ApiOutcome::Success(NoteInfo {
                    note_id: id.to_string(),
                    title: format!("title of {id}"),
                    comment_count,
                    ..NoteInfo::default()
                }),
            );
        }

        fn page(&self, note: &str, cursor: &str, comments: Vec<&str>) {
            let comments = comments
                .into_iter()
                .map(|id| WireComment {
                    id: id.to_string(),
                    content: "text".to_string(),
                    ..WireComment::default()
                })
                .collect();
            self.pages.lock().unwrap().insert(
                (note.to_string(), cursor.to_string()),
                ApiOutcome::Success(CommentPage {
                    comments,
                    has_more: false,
                    cursor: String::new(),
                }),
            );
        }
    }

    impl NoteApi for FakePlatform {
        async fn note_info(
            &self,
            _lease: Lease,
            note_id: &str,
            _xsec_token: &str,
        ) -> ApiOutcome<NoteInfo> {
            self.notes
                .lock()
                .unwrap()
                .get(note_id)
                .cloned()
                .unwrap_or(ApiOutcome::Protocol {
                    reason: "unknown note".to_string(),
                })
        }
    }

    impl CommentApi for FakePlatform {
        async fn top_comments_page(
            &self,
            _lease: Lease,
            note_id: &str,
            cursor: &str,
            _xsec_token: &str,
        ) -> ApiOutcome<CommentPage> {
            self.pages
                .lock()
                .unwrap()
                .get(&(note_id.to_string(), cursor.to_string()))
                .cloned()
                .unwrap_or(ApiOutcome::EmptyData)
        }

        async fn sub_comments_page(
            &self,
            _lease: Lease,
            _parent_id: &str,
            _note_id: &str,
            _cursor: &str,
            _xsec_token: &str,
        ) -> ApiOutcome<CommentPage> {
            ApiOutcome::EmptyData
        }
    }

    fn descriptor(id: &str) -> NoteDescriptor {
        NoteDescriptor {
            note_id: id.to_string(),
            xsec_token: "tok".to_string(),
            note_url: format!("https://www.xiaohongshu.com/explore/{id}?xsec_token=tok"),
            title: None,
            comment_count: None,
            source: None,
        }
    }

    struct Ctx {
        _dir: TempDir,
        pool: CredentialPool,
        policy: RetryPolicy,
        walker_cfg: WalkerConfig,
        cancel: CancelFlag,
        out: std::path::PathBuf,
    }

    fn ctx() -> Ctx {
        let dir = TempDir::new().unwrap();
        let pool = CredentialPool::open(dir.path().join("pool.json")).unwrap();
        pool.add("cookie-a", Some("cred_a"), "").unwrap();
        pool.tune(None, Some(1_000_000), Some(0)).unwrap();
        let out = dir.path().join("out");
        Ctx {
            _dir: dir,
            pool,
            policy: RetryPolicy {
                cooldown_wait: Duration::from_millis(10),
                short_backoff: Duration::from_millis(1),
                ..RetryPolicy::default()
            },
            walker_cfg: WalkerConfig {
                top_page_delay: Duration::ZERO,
                sub_page_delay: Duration::ZERO,
                ..WalkerConfig::default()
            },
            cancel: CancelFlag::new(),
            out,
        }
    }

    fn coordinator<'a>(c: &'a Ctx, api: &'a FakePlatform) -> Coordinator<'a, FakePlatform> {
        Coordinator {
            client: api,
            pool: &c.pool,
            policy: &c.policy,
            walker_cfg: &c.walker_cfg,
            cancel: &c.cancel,
            include_comments: true,
            recheck_incomplete: true,
        }
    }

    #[tokio::test]
    async fn single_note_end_to_end() {
        let c = ctx();
        let api = FakePlatform::default();
        api.note("n1", 1);
        api.page("n1", "", vec!["c1"]);

        let list = NoteList {
            query: None,
            notes: vec![descriptor("n1")],
        };
        let report = coordinator(&c, &api)
            .run(&list, &c.out, "input.json")
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.total_comments, 1);
        assert!(!report.cancelled);

        // Artifacts.
        assert!(c.out.join("note_n1_basic.json").exists());
        assert!(c.out.join("note_n1_full.json").exists());
        let jsonl = fs::read_to_string(c.out.join("note_n1_comments.jsonl")).unwrap();
        let line: Value = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
        assert_eq!(line["comment_id"], "c1");
        assert_eq!(line["_level"], 1);
        assert_eq!(line["parent_id"], "");
        assert_eq!(line["note_id"], "n1");

        let full: Value =
            serde_json::from_str(&fs::read_to_string(c.out.join("note_n1_full.json")).unwrap())
                .unwrap();
        assert_eq!(full["comment_count"], 1);

        // Progress.
        let progress: Value =
            serde_json::from_str(&fs::read_to_string(c.out.join("progress.json")).unwrap())
                .unwrap();
        assert_eq!(progress["notes_progress"]["n1"]["status"], "completed");
        assert_eq!(progress["statistics"]["completed"], 1);

        // Summary.
        let summary: Value = serde_json::from_str(
            &fs::read_to_string(c.out.join("summary_all_notes.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary["process_info"]["successful_notes"], 1);
        assert_eq!(summary["process_info"]["total_comments"], 1);

        // The credential got credit for the note.
        assert_eq!(c.pool.snapshot().accounts[0].total_notes, 1);
    }

    #[tokio::test]
    async fn one_bad_note_does_not_abort_the_batch() {
        let c = ctx();
        let api = FakePlatform::default();
        // n1 is unknown to the platform; n2 works.
        api.note("n2", 1);
        api.page("n2", "", vec!["k1"]);

        let list = NoteList {
            query: None,
            notes: vec![descriptor("n1"), descriptor("n2")],
        };
        let report = coordinator(&c, &api)
            .run(&list, &c.out, "input.json")
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);

        let progress: Value =
            serde_json::from_str(&fs::read_to_string(c.out.join("progress.json")).unwrap())
                .unwrap();
        assert_eq!(progress["notes_progress"]["n1"]["status"], "failed");
        assert!(progress["notes_progress"]["n1"]["error_message"]
            .as_str()
            .unwrap()
            .contains("protocol"));
        assert_eq!(progress["notes_progress"]["n2"]["status"], "completed");

        let summary: Value = serde_json::from_str(
            &fs::read_to_string(c.out.join("summary_all_notes.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary["failed_notes"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completed_notes_are_skipped_on_rerun() {
        let c = ctx();
        let api = FakePlatform::default();
        api.note("n1", 1);
        api.page("n1", "", vec!["c1"]);

        let list = NoteList {
            query: None,
            notes: vec![descriptor("n1")],
        };
        let first = coordinator(&c, &api)
            .run(&list, &c.out, "input.json")
            .await
            .unwrap();
        assert_eq!(first.succeeded, 1);

        let second = coordinator(&c, &api)
            .run(&list, &c.out, "input.json")
            .await
            .unwrap();
        assert_eq!(second.attempted, 0, "completed note is not re-crawled");
    }

    #[tokio::test]
    async fn cancellation_stops_the_batch_before_the_next_note() {
        let c = ctx();
        let api = FakePlatform::default();
        api.note("n1", 1);
        api.page("n1", "", vec!["c1"]);

        c.cancel.cancel();
        let list = NoteList {
            query: None,
            notes: vec![descriptor("n1")],
        };
        let report = coordinator(&c, &api)
            .run(&list, &c.out, "input.json")
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn walker_failure_marks_the_note_failed_with_reason() {
        let c = ctx();
        let api = FakePlatform::default();
        // Metadata promises comments, but every comment page is empty: the
        // expired-token classification path.
        api.note("n1", 5);

        let list = NoteList {
            query: None,
            notes: vec![descriptor("n1")],
        };
        let report = coordinator(&c, &api)
            .run(&list, &c.out, "input.json")
            .await
            .unwrap();
        assert_eq!(report.failed, 1);

        let progress: Value =
            serde_json::from_str(&fs::read_to_string(c.out.join("progress.json")).unwrap())
                .unwrap();
        let note = &progress["notes_progress"]["n1"];
        assert_eq!(note["status"], "failed");
        assert!(note["error_message"].as_str().unwrap().contains("token"));
        assert_eq!(note["comments"]["last_cursor"], "");
        // Basic metadata was still saved before the walk failed.
        assert!(c.out.join("note_n1_basic.json").exists());
        let matching = progress["statistics"]["failed"].as_u64().unwrap();
        assert_eq!(matching, 1);
    }

    #[tokio::test]
    async fn progress_status_enum_matches_wire_words() {
        // Guard against accidental renames of the status wire contract.
        assert_eq!(
            serde_json::to_value(NoteStatus::Processing).unwrap(),
            Value::String("processing".to_string())
        );
    }
}
