use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use eyre::{eyre, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Bounded ring of recent errors/warnings kept per note.
const RECENT_LOG_CAP: usize = 10;

const SAVE_ATTEMPTS: u32 = 3;
const SAVE_RETRY_DELAY: Duration = Duration::from_millis(100);

fn now_stamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NoteStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogEntry {
    pub message: String,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommentsProgress {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub expected: u64,
    #[serde(default)]
    pub fetched: u64,
    /// Cursor of the next unread page; resuming from it never skips records.
    #[serde(default)]
    pub last_cursor: String,
    #[serde(default)]
    pub current_page: u32,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub errors: Vec<LogEntry>,
    #[serde(default)]
    pub warnings: Vec<LogEntry>,
    #[serde(default)]
    pub last_update: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MediaCounters {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub done: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MediaProgress {
    #[serde(default)]
    pub images: MediaCounters,
    #[serde(default)]
    pub videos: MediaCounters,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NoteProgress {
    #[serde(default)]
    pub note_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status: NoteStatus,
    #[serde(default)]
    pub basic_info_saved: bool,
    #[serde(default)]
    pub comments: CommentsProgress,
    #[serde(default)]
    pub media: MediaProgress,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Statistics {
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub processing: u64,
    #[serde(default)]
    pub pending: u64,
    #[serde(default)]
    pub skipped: u64,
}

/// On-disk task record. Field names are a stable wire contract for external
/// dashboards.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskProgress {
    pub task_id: String,
    #[serde(default)]
    pub source_reference: String,
    #[serde(default)]
    pub output_dir: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub last_update: String,
    #[serde(default)]
    pub total_notes: u64,
    #[serde(default)]
    pub notes_progress: std::collections::BTreeMap<String, NoteProgress>,
    #[serde(default)]
    pub statistics: Statistics,
}

/// Owns `progress.json` for one task directory. Every mutation refreshes
/// `last_update`, recomputes the aggregate statistics and persists
/// atomically before returning.
pub struct ProgressManager {
    output_dir: PathBuf,
    path: PathBuf,
    data: TaskProgress,
    // Held for the lifetime of the task so two crawlers never share a
    // directory. Dropping the manager releases it.
    _lock: File,
}

impl ProgressManager {
    /// Create or load the progress file for `output_dir`.
    ///
    /// With `recheck_incomplete`, completed notes whose fetched count trails
    /// a non-zero expectation are demoted to `processing` so a later run
    /// picks them up again. This is how a run that declared success too
    /// eagerly heals itself.
    pub fn open(output_dir: &Path, source_reference: &str, recheck_incomplete: bool) -> Result<Self> {
        fs::create_dir_all(output_dir).map_err(|e| {
            eyre!(
                "failed to create output directory {}: {e}",
                output_dir.display()
            )
        })?;

        let lock_path = output_dir.join("task.lock");
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
        lock.try_lock_exclusive().map_err(|e| {
            eyre!(
                "another crawler is using {} ({e})",
                output_dir.display()
            )
        })?;

        let path = output_dir.join("progress.json");
        let mut data = if path.exists() {
            match fs::read_to_string(&path)
                .map_err(eyre::Report::from)
                .and_then(|raw| serde_json::from_str::<TaskProgress>(&raw).map_err(Into::into))
            {
                Ok(data) => {
                    tracing::info!(
                        task_id = %data.task_id,
                        last_update = %data.last_update,
                        completed = data.statistics.completed,
                        failed = data.statistics.failed,
                        "progress file loaded"
                    );
                    data
                }
                Err(err) => {
                    tracing::warn!(error = %err, "unreadable progress file; starting fresh");
                    Self::fresh(source_reference, output_dir)
                }
            }
        } else {
            tracing::info!(path = %path.display(), "creating new progress file");
            Self::fresh(source_reference, output_dir)
        };

        if recheck_incomplete {
            for note in data.notes_progress.values_mut() {
                if note.status == NoteStatus::Completed
                    && note.comments.expected > 0
                    && note.comments.fetched < note.comments.expected
                {
                    tracing::info!(
                        note_id = %note.note_id,
                        fetched = note.comments.fetched,
                        expected = note.comments.expected,
                        "completed note is short on comments; demoting for re-crawl"
                    );
                    note.status = NoteStatus::Processing;
                    note.comments.completed = false;
                }
            }
        }

        let mut manager = Self {
            output_dir: output_dir.to_path_buf(),
            path,
            data,
            _lock: lock,
        };
        manager.recompute_statistics();
        manager.save()?;
        Ok(manager)
    }

    fn fresh(source_reference: &str, output_dir: &Path) -> TaskProgress {
        TaskProgress {
            task_id: format!("task_{}", Local::now().format("%Y%m%d_%H%M%S")),
            source_reference: source_reference.to_string(),
            output_dir: output_dir.display().to_string(),
            start_time: now_stamp(),
            last_update: now_stamp(),
            ..TaskProgress::default()
        }
    }

    pub fn statistics(&self) -> &Statistics {
        &self.data.statistics
    }

    pub fn note(&self, note_id: &str) -> Option<&NoteProgress> {
        self.data.notes_progress.get(note_id)
    }

    /// Cursor and count to resume the comment walk from.
    pub fn resume_point(&self, note_id: &str) -> (String, u64) {
        self.data
            .notes_progress
            .get(note_id)
            .map(|n| (n.comments.last_cursor.clone(), n.comments.fetched))
            .unwrap_or_default()
    }

    /// True when the note finished in a previous run, either per the
    /// progress record or per an artifact file that predates it (in which
    /// case a stub record is inserted and counted as skipped).
    pub fn is_completed(&mut self, note_id: &str) -> bool {
        if let Some(note) = self.data.notes_progress.get(note_id) {
            return note.status == NoteStatus::Completed;
        }

        let full_file = self.output_dir.join(format!("note_{note_id}_full.json"));
        if full_file.exists() {
            let basic = self
                .output_dir
                .join(format!("note_{note_id}_basic.json"))
                .exists();
            let comments = self
                .output_dir
                .join(format!("note_{note_id}_comments.jsonl"))
                .exists();
            let stub = NoteProgress {
                note_id: note_id.to_string(),
                url: "unknown".to_string(),
                status: NoteStatus::Completed,
                basic_info_saved: basic,
                comments: CommentsProgress {
                    enabled: comments,
                    completed: comments,
                    ..CommentsProgress::default()
                },
                end_time: Some(now_stamp()),
                ..NoteProgress::default()
            };
            self.data.notes_progress.insert(note_id.to_string(), stub);
            self.data.statistics.skipped += 1;
            tracing::debug!(note_id, "existing artifact backfilled into progress");
            if let Err(err) = self.touch_and_save() {
                tracing::warn!(error = %err, "failed to persist backfilled record");
            }
            return true;
        }

        false
    }

    /// Filter the input list down to notes that still need work; failed
    /// notes are retried.
    pub fn pending_notes(&mut self, all: &[crate::input::NoteDescriptor]) -> Result<Vec<crate::input::NoteDescriptor>> {
        self.data.total_notes = all.len() as u64;

        let mut pending = Vec::new();
        let mut done = 0usize;
        let mut retried = 0usize;
        for descriptor in all {
            if self.is_completed(&descriptor.note_id) {
                done += 1;
                continue;
            }
            if let Some(note) = self.data.notes_progress.get(&descriptor.note_id) {
                if note.status == NoteStatus::Failed {
                    retried += 1;
                    tracing::info!(
                        note_id = %descriptor.note_id,
                        reason = note.error_message.as_deref().unwrap_or(""),
                        "retrying previously failed note"
                    );
                }
            }
            pending.push(descriptor.clone());
        }

        self.touch_and_save()?;
        tracing::info!(
            total = all.len(),
            completed = done,
            pending = pending.len(),
            retried,
            "progress summary"
        );
        Ok(pending)
    }

    pub fn mark_processing(&mut self, note_id: &str, url: &str) -> Result<()> {
        let entry = self
            .data
            .notes_progress
            .entry(note_id.to_string())
            .or_insert_with(|| NoteProgress {
                note_id: note_id.to_string(),
                ..NoteProgress::default()
            });
        entry.url = url.to_string();
        entry.status = NoteStatus::Processing;
        entry.start_time = Some(now_stamp());
        entry.end_time = None;
        entry.error_message = None;
        entry.comments.current_page = 0;
        entry.comments.errors.clear();
        entry.comments.warnings.clear();
        entry.comments.last_update = None;
        self.touch_and_save()
    }

    pub fn mark_completed(&mut self, note_id: &str, fetched: u64, comments_enabled: bool) -> Result<()> {
        if let Some(note) = self.data.notes_progress.get_mut(note_id) {
            note.status = NoteStatus::Completed;
            note.end_time = Some(now_stamp());
            note.comments.enabled = comments_enabled;
            note.comments.fetched = note.comments.fetched.max(fetched);
            note.comments.current_page = 0;
        }
        self.touch_and_save()
    }

    pub fn mark_failed(&mut self, note_id: &str, message: &str) -> Result<()> {
        if let Some(note) = self.data.notes_progress.get_mut(note_id) {
            note.status = NoteStatus::Failed;
            note.error_message = Some(truncate(message, 240));
            note.end_time = Some(now_stamp());
        }
        self.touch_and_save()
    }

    pub fn set_basic_saved(&mut self, note_id: &str) -> Result<()> {
        if let Some(note) = self.data.notes_progress.get_mut(note_id) {
            note.basic_info_saved = true;
        }
        self.touch_and_save()
    }

    pub fn set_expected(&mut self, note_id: &str, expected: u64) -> Result<()> {
        if let Some(note) = self.data.notes_progress.get_mut(note_id) {
            note.comments.enabled = true;
            note.comments.expected = expected;
            note.comments.last_update = Some(now_stamp());
        }
        self.touch_and_save()
    }

    /// `fetched` is monotonic within a task; a smaller value never wins.
    pub fn set_fetched(&mut self, note_id: &str, fetched: u64) -> Result<()> {
        if let Some(note) = self.data.notes_progress.get_mut(note_id) {
            note.comments.enabled = true;
            note.comments.fetched = note.comments.fetched.max(fetched);
            note.comments.last_update = Some(now_stamp());
        }
        self.touch_and_save()
    }

    /// Persist the cursor for the *next* unread page. Called before the
    /// walker advances, so a crash resumes without skipping.
    pub fn set_cursor(&mut self, note_id: &str, cursor: &str) -> Result<()> {
        if let Some(note) = self.data.notes_progress.get_mut(note_id) {
            note.comments.last_cursor = cursor.to_string();
            note.comments.last_update = Some(now_stamp());
        }
        self.touch_and_save()
    }

    pub fn record_page(&mut self, note_id: &str, page: u32) -> Result<()> {
        if let Some(note) = self.data.notes_progress.get_mut(note_id) {
            note.comments.current_page = page;
            note.comments.last_update = Some(now_stamp());
        }
        self.touch_and_save()
    }

    pub fn mark_comments_completed(&mut self, note_id: &str) -> Result<()> {
        if let Some(note) = self.data.notes_progress.get_mut(note_id) {
            note.comments.completed = true;
            note.comments.current_page = 0;
            note.comments.last_update = Some(now_stamp());
        }
        self.touch_and_save()
    }

    pub fn record_error(&mut self, note_id: &str, message: &str) -> Result<()> {
        if let Some(note) = self.data.notes_progress.get_mut(note_id) {
            push_bounded(&mut note.comments.errors, message);
        }
        self.touch_and_save()
    }

    pub fn record_warning(&mut self, note_id: &str, message: &str) -> Result<()> {
        if let Some(note) = self.data.notes_progress.get_mut(note_id) {
            push_bounded(&mut note.comments.warnings, message);
        }
        self.touch_and_save()
    }

    fn touch_and_save(&mut self) -> Result<()> {
        self.recompute_statistics();
        self.save()
    }

    /// The statistics block always equals the aggregate of note statuses;
    /// descriptors not yet seen count as pending. `skipped` is a separate
    /// tally of artifact-backfilled notes.
    fn recompute_statistics(&mut self) {
        let mut stats = Statistics {
            skipped: self.data.statistics.skipped,
            ..Statistics::default()
        };
        for note in self.data.notes_progress.values() {
            match note.status {
                NoteStatus::Pending => stats.pending += 1,
                NoteStatus::Processing => stats.processing += 1,
                NoteStatus::Completed => stats.completed += 1,
                NoteStatus::Failed => stats.failed += 1,
            }
        }
        let known = self.data.notes_progress.len() as u64;
        stats.pending += self.data.total_notes.saturating_sub(known);
        self.data.statistics = stats;
    }

    /// Atomic save: temp file, flush, fsync, rename; up to three attempts.
    pub fn save(&mut self) -> Result<()> {
        self.data.last_update = now_stamp();
        let json = serde_json::to_string_pretty(&self.data)
            .map_err(|e| eyre!("failed to serialize progress: {e}"))?;

        let tmp_path = self.path.with_extension("json.tmp");
        let mut last_err = None;
        for attempt in 1..=SAVE_ATTEMPTS {
            match write_atomic(&tmp_path, &self.path, &json) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "progress save failed");
                    last_err = Some(err);
                    let _ = fs::remove_file(&tmp_path);
                    if attempt < SAVE_ATTEMPTS {
                        std::thread::sleep(SAVE_RETRY_DELAY);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| eyre!("progress save failed")))
    }
}

fn write_atomic(tmp_path: &Path, path: &Path, json: &str) -> Result<()> {
    let mut tmp = File::create(tmp_path)
        .map_err(|e| eyre!("failed to create {}: {e}", tmp_path.display()))?;
    tmp.write_all(json.as_bytes())
        .and_then(|_| tmp.flush())
        .and_then(|_| tmp.sync_all())
        .map_err(|e| eyre!("failed to write {}: {e}", tmp_path.display()))?;
    drop(tmp);

    if let Err(err) = fs::rename(tmp_path, path) {
        if cfg!(windows) {
            let _ = fs::remove_file(path);
            fs::rename(tmp_path, path)
                .map_err(|e| eyre!("failed to replace {}: {e}", path.display()))?;
        } else {
            return Err(eyre!("failed to replace {}: {err}", path.display()));
        }
    }

    let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(eyre!("progress file is empty after rename"));
    }
    Ok(())
}

fn push_bounded(ring: &mut Vec<LogEntry>, message: &str) {
    ring.push(LogEntry {
        message: truncate(message, 240),
        time: now_stamp(),
    });
    if ring.len() > RECENT_LOG_CAP {
        let excess = ring.len() - RECENT_LOG_CAP;
        ring.drain(..excess);
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    // Char-wise, so multi-byte text never splits mid-codepoint.
    let mut out: String = s.chars().take(max_chars).collect();
    if out.len() < s.len() {
        out.push_str("...");
    }
    out
}
