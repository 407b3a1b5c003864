use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::cancel::CancelFlag;
use crate::client::{CommentApi, WireComment};
use crate::pool::CredentialPool;
use crate::progress::ProgressManager;
use crate::retry::{call_with_rotation, CrawlFailure, FailureKind, RetryPolicy};
use crate::sink::{CommentRecord, CommentSink};

#[derive(Debug, Clone)]
pub struct WalkerConfig {
    /// Deepest reply level that still gets expanded.
    pub max_level: u32,
    /// Pacing between successful top-level pages.
    pub top_page_delay: Duration,
    /// Pacing between successful sub-comment pages.
    pub sub_page_delay: Duration,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            max_level: 10,
            top_page_delay: Duration::from_millis(500),
            sub_page_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalkRequest {
    pub note_id: String,
    pub xsec_token: String,
    /// Comment count the note metadata advertises; 0 when unknown.
    pub expected_comments: u64,
}

/// What a walk produced. `fetched` is cumulative across resumed runs and
/// equals the progress counter; `failure` set means the note should be
/// marked failed, everything already emitted stays valid.
#[derive(Debug)]
pub struct WalkOutcome {
    pub fetched: u64,
    pub completed: bool,
    pub failure: Option<CrawlFailure>,
}

enum RunEnd {
    Completed,
    /// Pagination stopped on a warning (empty or malformed page); not a
    /// note failure, but not a confirmed-complete walk either.
    StoppedEarly,
}

/// Walk every comment of one note into the sink, surviving credential
/// exhaustion on any single page. Resumes from the progress cursor when one
/// is recorded.
#[allow(clippy::too_many_arguments)]
pub async fn walk_note_comments<C: CommentApi + Sync>(
    client: &C,
    pool: &CredentialPool,
    policy: &RetryPolicy,
    cfg: &WalkerConfig,
    progress: &mut ProgressManager,
    sink: &mut dyn CommentSink,
    req: &WalkRequest,
    cancel: &CancelFlag,
) -> WalkOutcome {
    let (resume_cursor, resume_fetched) = progress.resume_point(&req.note_id);
    let mut walker = Walker {
        client,
        pool,
        policy,
        cfg,
        progress,
        sink,
        req,
        cancel,
        fetched: resume_fetched,
    };
    let end = walker.run(resume_cursor).await;
    let fetched = walker.fetched;
    match end {
        Ok(RunEnd::Completed) => WalkOutcome {
            fetched,
            completed: true,
            failure: None,
        },
        Ok(RunEnd::StoppedEarly) => WalkOutcome {
            fetched,
            completed: false,
            failure: None,
        },
        Err(failure) => WalkOutcome {
            fetched,
            completed: false,
            failure: Some(failure),
        },
    }
}

struct Walker<'a, C: CommentApi + Sync> {
    client: &'a C,
    pool: &'a CredentialPool,
    policy: &'a RetryPolicy,
    cfg: &'a WalkerConfig,
    progress: &'a mut ProgressManager,
    sink: &'a mut dyn CommentSink,
    req: &'a WalkRequest,
    cancel: &'a CancelFlag,
    fetched: u64,
}

fn storage(err: eyre::Report) -> CrawlFailure {
    CrawlFailure::new(FailureKind::Storage, err.to_string())
}

impl<'a, C: CommentApi + Sync> Walker<'a, C> {
    async fn run(&mut self, resume_cursor: String) -> Result<RunEnd, CrawlFailure> {
        let note_id = self.req.note_id.clone();

        if self.req.expected_comments > 0 {
            self.progress
                .set_expected(&note_id, self.req.expected_comments)
                .map_err(storage)?;
        }
        if !resume_cursor.is_empty() {
            tracing::info!(
                note_id = %note_id,
                cursor = %resume_cursor,
                already_fetched = self.fetched,
                "resuming comment walk from saved cursor"
            );
        }

        let mut cursor = resume_cursor;
        let mut page: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(CrawlFailure::cancelled());
            }
            page += 1;
            self.progress.record_page(&note_id, page).map_err(storage)?;
            tracing::info!(
                note_id = %note_id,
                page,
                fetched = self.fetched,
                expected = self.req.expected_comments,
                "fetching top-level comments page"
            );

            // An empty payload on the very first page of a note known to
            // have comments is how an expired signed token manifests.
            let treat_empty_as_auth =
                cursor.is_empty() && self.fetched == 0 && self.req.expected_comments > 0;

            let client = self.client;
            let req = self.req;
            let cur = cursor.clone();
            let result = call_with_rotation(
                self.pool,
                self.policy,
                self.cancel,
                "top-level comments page",
                |lease| {
                    let fut =
                        client.top_comments_page(lease, &req.note_id, &cur, &req.xsec_token);
                    async move { fut.await.empty_as_auth_expired(treat_empty_as_auth) }
                },
            )
            .await;

            let page_data = match result {
                Ok((page_data, _lease)) => page_data,
                Err(failure) if failure.kind == FailureKind::Protocol => {
                    tracing::warn!(note_id = %note_id, page, reason = %failure.reason, "page returned no usable data; stopping");
                    self.progress
                        .record_warning(&note_id, &format!("page {page}: {}", failure.reason))
                        .map_err(storage)?;
                    return Ok(RunEnd::StoppedEarly);
                }
                Err(failure) => {
                    self.progress
                        .record_error(&note_id, &failure.to_string())
                        .map_err(storage)?;
                    return Err(failure);
                }
            };

            let got = page_data.comments.len();
            for comment in &page_data.comments {
                self.emit(comment, 1, "")?;
                self.expand(comment, 1).await?;
            }
            self.progress
                .set_fetched(&note_id, self.fetched)
                .map_err(storage)?;
            tracing::info!(note_id = %note_id, page, got, total = self.fetched, "page persisted");

            if !page_data.has_more || page_data.cursor.is_empty() {
                self.progress
                    .mark_comments_completed(&note_id)
                    .map_err(storage)?;
                return Ok(RunEnd::Completed);
            }

            // Persist the next page's cursor before advancing, so a crash
            // resumes at the first unseen page.
            self.progress
                .set_cursor(&note_id, &page_data.cursor)
                .map_err(storage)?;
            cursor = page_data.cursor;

            if !self.cancel.sleep(self.cfg.top_page_delay).await {
                return Err(CrawlFailure::cancelled());
            }
        }
    }

    /// Depth-first expansion of one comment's replies. The inline list the
    /// server embedded is emitted first; pagination happens only when it is
    /// short of the advertised count, and then runs until the server says
    /// `has_more == false`.
    fn expand<'b>(
        &'b mut self,
        parent: &'b WireComment,
        level: u32,
    ) -> Pin<Box<dyn Future<Output = Result<(), CrawlFailure>> + Send + 'b>> {
        Box::pin(async move {
            if parent.sub_comment_count == 0 && parent.sub_comments.is_empty() {
                return Ok(());
            }
            let child_level = level + 1;
            if child_level > self.cfg.max_level {
                tracing::debug!(
                    parent = %parent.id,
                    level,
                    "reply depth limit reached; not expanding further"
                );
                return Ok(());
            }

            let mut emitted: u64 = 0;
            for child in &parent.sub_comments {
                self.emit(child, child_level, &parent.id)?;
                emitted += 1;
                self.expand(child, child_level).await?;
            }

            if (parent.sub_comments.len() as u64) < parent.sub_comment_count {
                emitted += self.paginate_children(parent, child_level).await?;
            }

            // The server is known to under-deliver on big threads; leave a
            // trace when the shortfall is more than 10%.
            if parent.sub_comment_count > 0 && emitted * 10 < parent.sub_comment_count * 9 {
                let warning = format!(
                    "comment {}: expected {} replies, got {}",
                    parent.id, parent.sub_comment_count, emitted
                );
                tracing::warn!(note_id = %self.req.note_id, %warning);
                self.progress
                    .record_warning(&self.req.note_id, &warning)
                    .map_err(storage)?;
            }
            Ok(())
        })
    }

    async fn paginate_children(
        &mut self,
        parent: &WireComment,
        child_level: u32,
    ) -> Result<u64, CrawlFailure> {
        let mut emitted: u64 = 0;
        let mut cursor = parent.sub_comment_cursor.clone();
        loop {
            if self.cancel.is_cancelled() {
                return Err(CrawlFailure::cancelled());
            }

            let client = self.client;
            let req = self.req;
            let parent_id = parent.id.clone();
            let cur = cursor.clone();
            let result = call_with_rotation(
                self.pool,
                self.policy,
                self.cancel,
                "sub-comments page",
                |lease| {
                    client.sub_comments_page(lease, &parent_id, &req.note_id, &cur, &req.xsec_token)
                },
            )
            .await;

            let page = match result {
                Ok((page, _lease)) => page,
                Err(failure) if failure.kind == FailureKind::Protocol => {
                    self.progress
                        .record_warning(
                            &self.req.note_id,
                            &format!("replies of {}: {}", parent.id, failure.reason),
                        )
                        .map_err(storage)?;
                    return Ok(emitted);
                }
                Err(failure) => {
                    self.progress
                        .record_warning(
                            &self.req.note_id,
                            &format!("replies of {}: {failure}", parent.id),
                        )
                        .map_err(storage)?;
                    return Err(failure);
                }
            };

            for child in &page.comments {
                self.emit(child, child_level, &parent.id)?;
                emitted += 1;
                self.expand(child, child_level).await?;
            }
            self.progress
                .set_fetched(&self.req.note_id, self.fetched)
                .map_err(storage)?;

            if !page.has_more || page.cursor.is_empty() {
                return Ok(emitted);
            }
            cursor = page.cursor;

            if !self.cancel.sleep(self.cfg.sub_page_delay).await {
                return Err(CrawlFailure::cancelled());
            }
        }
    }

    fn emit(
        &mut self,
        comment: &WireComment,
        level: u32,
        parent_id: &str,
    ) -> Result<(), CrawlFailure> {
        let record = CommentRecord {
            comment_id: comment.id.clone(),
            parent_id: parent_id.to_string(),
            note_id: self.req.note_id.clone(),
            level,
            body: comment.content.clone(),
            author: comment.user_info.nickname.clone(),
            author_id: comment.user_info.user_id.clone(),
            timestamp: comment.create_time,
            sub_comment_count: comment.sub_comment_count,
        };
        self.sink.emit(&record).map_err(storage)?;
        self.fetched += 1;
        if self.fetched % 50 == 0 {
            self.progress
                .set_fetched(&self.req.note_id, self.fetched)
                .map_err(storage)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CommentPage;
    use crate::pool::Lease;
    use crate::sink::MemorySink;
    use crate::transport::ApiOutcome;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted comment endpoints: per-cursor queues of outcomes, consumed
    /// in order; a drained or missing queue answers `EmptyData`.
    #[derive(Default)]
    struct FakeApi {
        top: Mutex<HashMap<String, VecDeque<ApiOutcome<CommentPage>>>>,
        sub: Mutex<HashMap<(String, String), VecDeque<ApiOutcome<CommentPage>>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeApi {
        fn script_top(&self, cursor: &str, outcomes: Vec<ApiOutcome<CommentPage>>) {
            self.top
                .lock()
                .unwrap()
                .insert(cursor.to_string(), outcomes.into());
        }

        fn script_sub(&self, parent: &str, cursor: &str, outcomes: Vec<ApiOutcome<CommentPage>>) {
            self.sub
                .lock()
                .unwrap()
                .insert((parent.to_string(), cursor.to_string()), outcomes.into());
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommentApi for FakeApi {
        async fn top_comments_page(
            &self,
            _lease: Lease,
            _note_id: &str,
            cursor: &str,
            _xsec_token: &str,
        ) -> ApiOutcome<CommentPage> {
            self.calls
                .lock()
                .unwrap()
                .push(("top".to_string(), cursor.to_string()));
            self.top
                .lock()
                .unwrap()
                .get_mut(cursor)
                .and_then(VecDeque::pop_front)
                .unwrap_or(ApiOutcome::EmptyData)
        }

        async fn sub_comments_page(
            &self,
            _lease: Lease,
            parent_id: &str,
            _note_id: &str,
            cursor: &str,
            _xsec_token: &str,
        ) -> ApiOutcome<CommentPage> {
            self.calls
                .lock()
                .unwrap()
                .push((format!("sub:{parent_id}"), cursor.to_string()));
            self.sub
                .lock()
                .unwrap()
                .get_mut(&(parent_id.to_string(), cursor.to_string()))
                .and_then(VecDeque::pop_front)
                .unwrap_or(ApiOutcome::EmptyData)
        }
    }

    fn wc(id: &str, sub_count: u64) -> WireComment {
        WireComment {
            id: id.to_string(),
            content: format!("body of {id}"),
            sub_comment_count: sub_count,
            ..WireComment::default()
        }
    }

    fn page(comments: Vec<WireComment>, has_more: bool, cursor: &str) -> ApiOutcome<CommentPage> {
        ApiOutcome::Success(CommentPage {
            comments,
            has_more,
            cursor: cursor.to_string(),
        })
    }

    struct Harness {
        _dir: TempDir,
        pool: CredentialPool,
        progress: ProgressManager,
        policy: RetryPolicy,
        cfg: WalkerConfig,
        cancel: CancelFlag,
    }

    fn harness(credentials: usize) -> Harness {
        let dir = TempDir::new().unwrap();
        let pool = CredentialPool::open(dir.path().join("pool.json")).unwrap();
        for i in 0..credentials {
            pool.add(&format!("cookie-{i}"), None, "").unwrap();
        }
        pool.tune(None, Some(1_000_000), Some(0)).unwrap();
        let progress = ProgressManager::open(&dir.path().join("out"), "test", true).unwrap();
        Harness {
            _dir: dir,
            pool,
            progress,
            policy: RetryPolicy {
                per_credential_attempts: 3,
                max_wait_rounds: 3,
                cooldown_wait: Duration::from_millis(30),
                short_backoff: Duration::from_millis(1),
            },
            cfg: WalkerConfig {
                max_level: 10,
                top_page_delay: Duration::ZERO,
                sub_page_delay: Duration::ZERO,
            },
            cancel: CancelFlag::new(),
        }
    }

    fn request(expected: u64) -> WalkRequest {
        WalkRequest {
            note_id: "n1".to_string(),
            xsec_token: "tok".to_string(),
            expected_comments: expected,
        }
    }

    async fn walk(h: &mut Harness, api: &FakeApi, sink: &mut MemorySink, req: &WalkRequest) -> WalkOutcome {
        walk_note_comments(
            api,
            &h.pool,
            &h.policy,
            &h.cfg,
            &mut h.progress,
            sink,
            req,
            &h.cancel,
        )
        .await
    }

    #[tokio::test]
    async fn cold_start_single_comment() {
        let mut h = harness(1);
        let api = FakeApi::default();
        api.script_top("", vec![page(vec![wc("c1", 0)], false, "")]);

        let mut sink = MemorySink::default();
        h.progress.mark_processing("n1", "url").unwrap();
        let outcome = walk(&mut h, &api, &mut sink, &request(1)).await;

        assert!(outcome.completed);
        assert!(outcome.failure.is_none());
        assert_eq!(outcome.fetched, 1);
        assert_eq!(sink.records.len(), 1);
        assert_eq!(sink.records[0].comment_id, "c1");
        assert_eq!(sink.records[0].level, 1);
        assert_eq!(sink.records[0].parent_id, "");

        let note = h.progress.note("n1").unwrap();
        assert!(note.comments.completed);
        assert_eq!(note.comments.fetched, 1);
    }

    #[tokio::test]
    async fn rate_limit_rotates_to_second_credential() {
        let mut h = harness(2);
        let api = FakeApi::default();
        api.script_top(
            "",
            vec![
                ApiOutcome::RateLimited,
                page(vec![wc("c1", 0)], false, ""),
            ],
        );

        let mut sink = MemorySink::default();
        h.progress.mark_processing("n1", "url").unwrap();
        let outcome = walk(&mut h, &api, &mut sink, &request(1)).await;

        assert!(outcome.completed);
        assert_eq!(sink.records.len(), 1);

        let snap = h.pool.snapshot();
        let limited: Vec<_> = snap.accounts.iter().filter(|a| a.error_count == 1).collect();
        let succeeded: Vec<_> = snap.accounts.iter().filter(|a| a.success_count == 1).collect();
        assert_eq!(limited.len(), 1, "exactly one credential saw the limit");
        assert_eq!(succeeded.len(), 1, "exactly one credential succeeded");
        assert!(limited[0].cooldown_until.is_none(), "one error is below the cooldown threshold");
        assert_ne!(limited[0].fingerprint, succeeded[0].fingerprint);
    }

    #[tokio::test]
    async fn expired_token_on_first_page_fails_the_note() {
        let mut h = harness(2);
        let api = FakeApi::default();
        // No scripts: every top-level fetch answers EmptyData.

        let mut sink = MemorySink::default();
        h.progress.mark_processing("n1", "url").unwrap();
        let outcome = walk(&mut h, &api, &mut sink, &request(5)).await;

        let failure = outcome.failure.expect("note must fail");
        assert_eq!(failure.kind, FailureKind::AuthExpired);
        assert!(failure.reason.contains("token"));
        assert!(sink.records.is_empty());
        assert!(!outcome.completed);

        let note = h.progress.note("n1").unwrap();
        assert_eq!(note.comments.last_cursor, "");
        assert!(!note.comments.errors.is_empty());
        // Both credentials were burned on the rotation.
        assert_eq!(api.calls().len(), 2);
    }

    #[tokio::test]
    async fn empty_page_mid_stream_is_a_warning_not_a_failure() {
        let mut h = harness(1);
        let api = FakeApi::default();
        api.script_top("", vec![page(vec![wc("c1", 0)], true, "c1")]);
        // Cursor c1 is unscripted, so it answers EmptyData mid-stream.

        let mut sink = MemorySink::default();
        h.progress.mark_processing("n1", "url").unwrap();
        let outcome = walk(&mut h, &api, &mut sink, &request(5)).await;

        assert!(outcome.failure.is_none());
        assert!(!outcome.completed);
        assert_eq!(sink.records.len(), 1);
        let note = h.progress.note("n1").unwrap();
        assert!(!note.comments.warnings.is_empty());
        assert_eq!(note.comments.last_cursor, "c1");
    }

    #[tokio::test]
    async fn resume_starts_at_saved_cursor_and_skips_nothing() {
        let mut h = harness(1);
        let api = FakeApi::default();
        api.script_top("c2", vec![page(vec![wc("c5", 0), wc("c6", 0)], false, "")]);

        h.progress.mark_processing("n1", "url").unwrap();
        h.progress.set_fetched("n1", 4).unwrap();
        h.progress.set_cursor("n1", "c2").unwrap();

        let mut sink = MemorySink::default();
        let outcome = walk(&mut h, &api, &mut sink, &request(6)).await;

        assert!(outcome.completed);
        // Pages 1 and 2 were never re-requested.
        assert_eq!(api.calls(), vec![("top".to_string(), "c2".to_string())]);
        assert_eq!(sink.records.len(), 2);
        assert_eq!(outcome.fetched, 6);
        assert_eq!(h.progress.note("n1").unwrap().comments.fetched, 6);
    }

    #[tokio::test]
    async fn cursor_is_persisted_before_advancing() {
        let mut h = harness(1);
        let api = FakeApi::default();
        api.script_top("", vec![page(vec![wc("c1", 0)], true, "c1")]);
        // Page at c1 rate-limits forever; the single credential exhausts.
        api.script_top(
            "c1",
            vec![
                ApiOutcome::RateLimited,
                ApiOutcome::RateLimited,
                ApiOutcome::RateLimited,
                ApiOutcome::RateLimited,
            ],
        );

        let mut sink = MemorySink::default();
        h.progress.mark_processing("n1", "url").unwrap();
        let outcome = walk(&mut h, &api, &mut sink, &request(10)).await;

        // Three limited calls push the lone credential into cooldown, and
        // the wait-round budget runs dry against an empty pool.
        let failure = outcome.failure.expect("walk must fail");
        assert_eq!(failure.kind, FailureKind::CredentialExhausted);
        // Already-emitted comments are preserved, and the cursor points at
        // the failed page so a later run resumes there.
        assert_eq!(sink.records.len(), 1);
        assert_eq!(h.progress.note("n1").unwrap().comments.last_cursor, "c1");
    }

    #[tokio::test]
    async fn deep_reply_tree_is_emitted_depth_first() {
        let mut h = harness(1);
        let api = FakeApi::default();
        api.script_top("", vec![page(vec![wc("T", 2)], false, "")]);
        api.script_sub("T", "", vec![page(vec![wc("r1", 1), wc("r2", 0)], false, "")]);
        api.script_sub("r1", "", vec![page(vec![wc("rr1", 0)], false, "")]);

        let mut sink = MemorySink::default();
        h.progress.mark_processing("n1", "url").unwrap();
        let outcome = walk(&mut h, &api, &mut sink, &request(4)).await;

        assert!(outcome.completed);
        let ids: Vec<&str> = sink.records.iter().map(|r| r.comment_id.as_str()).collect();
        assert_eq!(ids, vec!["T", "r1", "rr1", "r2"]);
        let levels: Vec<u32> = sink.records.iter().map(|r| r.level).collect();
        assert_eq!(levels, vec![1, 2, 3, 2]);
        let parents: Vec<&str> = sink.records.iter().map(|r| r.parent_id.as_str()).collect();
        assert_eq!(parents, vec!["", "T", "r1", "T"]);
    }

    #[tokio::test]
    async fn sibling_subtrees_are_contiguous() {
        let mut h = harness(1);
        let api = FakeApi::default();
        api.script_top("", vec![page(vec![wc("A", 1), wc("B", 1)], false, "")]);
        api.script_sub("A", "", vec![page(vec![wc("a1", 0)], false, "")]);
        api.script_sub("B", "", vec![page(vec![wc("b1", 0)], false, "")]);

        let mut sink = MemorySink::default();
        h.progress.mark_processing("n1", "url").unwrap();
        walk(&mut h, &api, &mut sink, &request(4)).await;

        let ids: Vec<&str> = sink.records.iter().map(|r| r.comment_id.as_str()).collect();
        // Every descendant of A lands before anything of B.
        assert_eq!(ids, vec!["A", "a1", "B", "b1"]);
    }

    #[tokio::test]
    async fn complete_inline_list_skips_sub_fetching() {
        let mut h = harness(1);
        let api = FakeApi::default();
        let mut parent = wc("T", 2);
        parent.sub_comments = vec![wc("r1", 0), wc("r2", 0)];
        parent.sub_comment_cursor = "should-not-be-used".to_string();
        api.script_top("", vec![page(vec![parent], false, "")]);

        let mut sink = MemorySink::default();
        h.progress.mark_processing("n1", "url").unwrap();
        let outcome = walk(&mut h, &api, &mut sink, &request(3)).await;

        assert!(outcome.completed);
        assert_eq!(sink.records.len(), 3);
        // Only the single top-level request went out.
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test]
    async fn short_inline_list_paginates_from_parent_cursor() {
        let mut h = harness(1);
        let api = FakeApi::default();
        let mut parent = wc("T", 3);
        parent.sub_comments = vec![wc("r1", 0)];
        parent.sub_comment_cursor = "sc1".to_string();
        api.script_top("", vec![page(vec![parent], false, "")]);
        api.script_sub("T", "sc1", vec![page(vec![wc("r2", 0)], true, "sc2")]);
        api.script_sub("T", "sc2", vec![page(vec![wc("r3", 0)], false, "")]);

        let mut sink = MemorySink::default();
        h.progress.mark_processing("n1", "url").unwrap();
        let outcome = walk(&mut h, &api, &mut sink, &request(4)).await;

        assert!(outcome.completed);
        let ids: Vec<&str> = sink.records.iter().map(|r| r.comment_id.as_str()).collect();
        assert_eq!(ids, vec!["T", "r1", "r2", "r3"]);
        assert!(api
            .calls()
            .contains(&("sub:T".to_string(), "sc1".to_string())));
    }

    #[tokio::test]
    async fn depth_limit_stops_expansion() {
        let mut h = harness(1);
        h.cfg.max_level = 2;
        let api = FakeApi::default();
        api.script_top("", vec![page(vec![wc("T", 1)], false, "")]);
        // r1 claims replies, but level 3 is beyond the limit.
        api.script_sub("T", "", vec![page(vec![wc("r1", 5)], false, "")]);

        let mut sink = MemorySink::default();
        h.progress.mark_processing("n1", "url").unwrap();
        let outcome = walk(&mut h, &api, &mut sink, &request(2)).await;

        assert!(outcome.completed);
        let ids: Vec<&str> = sink.records.iter().map(|r| r.comment_id.as_str()).collect();
        assert_eq!(ids, vec!["T", "r1"]);
        assert!(!api.calls().iter().any(|(k, _)| k == "sub:r1"));
    }

    #[tokio::test]
    async fn all_credentials_cooling_down_waits_then_succeeds() {
        let mut h = harness(2);
        h.policy.cooldown_wait = Duration::from_millis(60);
        let api = FakeApi::default();
        api.script_top("", vec![page(vec![wc("c1", 0)], false, "")]);

        for account in h.pool.snapshot().accounts {
            h.pool
                .set_cooldown(&account.fingerprint, Duration::from_millis(100))
                .unwrap();
        }

        let mut sink = MemorySink::default();
        h.progress.mark_processing("n1", "url").unwrap();
        let outcome = walk(&mut h, &api, &mut sink, &request(1)).await;

        assert!(outcome.completed, "walk succeeds once a cooldown lapses");
        assert_eq!(sink.records.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_preserves_cursor_and_partial_output() {
        let mut h = harness(1);
        let api = FakeApi::default();
        api.script_top("", vec![page(vec![wc("c1", 0)], true, "c1")]);
        api.script_top("c1", vec![page(vec![wc("c2", 0)], false, "")]);

        h.progress.mark_processing("n1", "url").unwrap();
        h.cancel.cancel();
        let mut sink = MemorySink::default();
        let outcome = walk(&mut h, &api, &mut sink, &request(2)).await;

        let failure = outcome.failure.expect("cancelled walk reports failure");
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert!(sink.records.is_empty());
    }

    #[tokio::test]
    async fn short_subtree_records_a_completeness_warning() {
        let mut h = harness(1);
        let api = FakeApi::default();
        api.script_top("", vec![page(vec![wc("T", 100)], false, "")]);
        api.script_sub("T", "", vec![page(vec![wc("r1", 0)], false, "")]);

        let mut sink = MemorySink::default();
        h.progress.mark_processing("n1", "url").unwrap();
        let outcome = walk(&mut h, &api, &mut sink, &request(101)).await;

        assert!(outcome.completed);
        let note = h.progress.note("n1").unwrap();
        assert!(note
            .comments
            .warnings
            .iter()
            .any(|w| w.message.contains("expected 100 replies")));
    }
}
