use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use eyre::{eyre, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Consecutive errors before a credential is put into cooldown.
pub const SOFT_COOLDOWN_THRESHOLD: u32 = 3;
/// Consecutive errors before a credential is deactivated outright.
pub const HARD_DISABLE_THRESHOLD: u32 = 10;
/// Consecutive errors that make a credential ineligible for `acquire`
/// without disabling it.
const ACQUIRE_ERROR_THRESHOLD: u32 = 5;

const COOLDOWN_STEP_MINUTES: i64 = 5;
const COOLDOWN_CAP_MINUTES: i64 = 60;

const DEFAULT_DAILY_LIMIT: u32 = 100;
const DEFAULT_MIN_INTERVAL_SECS: u64 = 3;

fn default_true() -> bool {
    true
}
fn default_daily_limit() -> u32 {
    DEFAULT_DAILY_LIMIT
}
fn default_min_interval() -> u64 {
    DEFAULT_MIN_INTERVAL_SECS
}

/// One credential record. Wire field names are a stable contract with the
/// config file; runtime-only fields are persisted too so cooldowns survive
/// restarts, and all of them are optional on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub cookie_str: String,
    pub name: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    /// Consecutive errors; decremented on success (floor 0).
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub total_notes: u64,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// Minimum seconds between two uses of this credential.
    #[serde(default = "default_min_interval")]
    pub min_interval: u64,
    #[serde(default)]
    pub daily_use_count: u32,
    #[serde(default)]
    pub last_use_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_reset_date: Option<NaiveDate>,

    /// Derived from `cookie_str`; never trusted from disk.
    #[serde(skip)]
    pub fingerprint: String,
}

/// Why a credential cannot be used right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    Disabled,
    CoolingDown { remaining_secs: i64 },
    MinInterval { wait_secs: i64 },
    DailyCapReached,
    TooManyErrors,
}

impl fmt::Display for Ineligible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ineligible::Disabled => write!(f, "disabled"),
            Ineligible::CoolingDown { remaining_secs } => {
                write!(f, "cooling down for {remaining_secs}s")
            }
            Ineligible::MinInterval { wait_secs } => {
                write!(f, "used too recently; {wait_secs}s until eligible")
            }
            Ineligible::DailyCapReached => write!(f, "daily cap reached"),
            Ineligible::TooManyErrors => write!(f, "too many consecutive errors"),
        }
    }
}

pub fn fingerprint_of(cookie_str: &str) -> String {
    let digest = Sha256::digest(cookie_str.as_bytes());
    hex::encode(digest)
}

impl Credential {
    fn new(cookie_str: &str, name: Option<&str>, remark: &str) -> Self {
        let fingerprint = fingerprint_of(cookie_str);
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("account_{}", &fingerprint[..8]));
        Self {
            cookie_str: cookie_str.to_string(),
            name,
            remark: remark.to_string(),
            is_active: true,
            use_count: 0,
            success_count: 0,
            fail_count: 0,
            error_count: 0,
            total_notes: 0,
            daily_limit: DEFAULT_DAILY_LIMIT,
            min_interval: DEFAULT_MIN_INTERVAL_SECS,
            daily_use_count: 0,
            last_use_time: None,
            cooldown_until: None,
            last_reset_date: None,
            fingerprint,
        }
    }

    fn reset_daily_if_rolled_over(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        match self.last_reset_date {
            Some(last) if last >= today => {}
            _ => {
                if self.daily_use_count > 0 {
                    tracing::debug!(name = %self.name, "daily counter reset");
                }
                self.daily_use_count = 0;
                self.last_reset_date = Some(today);
            }
        }
    }

    fn eligibility(&mut self, now: DateTime<Utc>) -> Option<Ineligible> {
        if !self.is_active {
            return Some(Ineligible::Disabled);
        }
        if let Some(until) = self.cooldown_until {
            if now < until {
                return Some(Ineligible::CoolingDown {
                    remaining_secs: (until - now).num_seconds(),
                });
            }
        }
        if let Some(last) = self.last_use_time {
            let elapsed = (now - last).num_seconds();
            let min = self.min_interval as i64;
            if elapsed < min {
                return Some(Ineligible::MinInterval {
                    wait_secs: min - elapsed,
                });
            }
        }
        self.reset_daily_if_rolled_over(now);
        if self.daily_use_count >= self.daily_limit {
            return Some(Ineligible::DailyCapReached);
        }
        if self.error_count >= ACQUIRE_ERROR_THRESHOLD {
            return Some(Ineligible::TooManyErrors);
        }
        None
    }
}

/// Snapshot handed to callers. Holds no lock and no live counters, so a
/// caller can never mutate pool state except through pool operations, and
/// leases are reacquired after any wait.
#[derive(Debug, Clone)]
pub struct Lease {
    pub fingerprint: String,
    pub name: String,
    pub cookie_str: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
    LeastUsed,
}

impl FromStr for Strategy {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round_robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "least_used" => Ok(Strategy::LeastUsed),
            other => Err(eyre!(
                "unknown strategy '{other}' (expected round_robin, random or least_used)"
            )),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::Random => "random",
            Strategy::LeastUsed => "least_used",
        };
        f.write_str(s)
    }
}

/// Wire shape of the credential config file.
#[derive(Debug, Serialize, Deserialize, Default)]
struct PoolFile {
    #[serde(default)]
    strategy: Strategy,
    #[serde(default)]
    accounts: Vec<Credential>,
}

struct PoolState {
    strategy: Strategy,
    /// fingerprint -> credential. BTreeMap keeps iteration ordered by
    /// fingerprint, which is what round-robin indexes over.
    accounts: BTreeMap<String, Credential>,
    rotation_cursor: u64,
}

/// The credential pool. All mutations are serialized behind one mutex and
/// flushed to the config file before the lock is released.
pub struct CredentialPool {
    path: PathBuf,
    state: Mutex<PoolState>,
}

#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub strategy: Strategy,
    pub total: usize,
    pub active: usize,
    pub available: usize,
    pub accounts: Vec<Credential>,
}

impl CredentialPool {
    /// Load the pool from `path`, or start empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = PoolFile::default();
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| eyre!("failed to read credential file {}: {e}", path.display()))?;
            file = serde_json::from_str(&raw)
                .map_err(|e| eyre!("failed to parse credential file {}: {e}", path.display()))?;
        }

        let mut accounts = BTreeMap::new();
        for mut account in file.accounts {
            account.fingerprint = fingerprint_of(&account.cookie_str);
            if accounts
                .insert(account.fingerprint.clone(), account)
                .is_some()
            {
                tracing::warn!("duplicate credential in config file; keeping the last one");
            }
        }

        tracing::info!(
            accounts = accounts.len(),
            strategy = %file.strategy,
            path = %path.display(),
            "credential pool loaded"
        );

        Ok(Self {
            path,
            state: Mutex::new(PoolState {
                strategy: file.strategy,
                accounts,
                rotation_cursor: 0,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("pool lock").accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn strategy(&self) -> Strategy {
        self.state.lock().expect("pool lock").strategy
    }

    /// Insert a credential if its fingerprint is not already present.
    /// Returns the fingerprint on insert, None when it already existed.
    pub fn add(&self, cookie_str: &str, name: Option<&str>, remark: &str) -> Result<Option<String>> {
        let cookie_str = cookie_str.trim();
        if cookie_str.is_empty() {
            return Err(eyre!("refusing to add an empty credential"));
        }
        let mut state = self.state.lock().expect("pool lock");
        let cred = Credential::new(cookie_str, name, remark);
        if state.accounts.contains_key(&cred.fingerprint) {
            tracing::warn!(name = %cred.name, "credential already in pool");
            return Ok(None);
        }
        let fp = cred.fingerprint.clone();
        tracing::info!(name = %cred.name, fingerprint = %&fp[..8], "credential added");
        state.accounts.insert(fp.clone(), cred);
        self.persist(&state)?;
        Ok(Some(fp))
    }

    pub fn remove(&self, fingerprint: &str) -> Result<bool> {
        let mut state = self.state.lock().expect("pool lock");
        let removed = state.accounts.remove(fingerprint);
        if let Some(cred) = &removed {
            tracing::info!(name = %cred.name, "credential removed");
            self.persist(&state)?;
        }
        Ok(removed.is_some())
    }

    /// Batch-add credentials from a text file: one per line, either
    /// `cookie`, `name|cookie` or `name|cookie|remark`; `#` starts a comment.
    pub fn import_lines(&self, contents: &str) -> Result<usize> {
        let mut added = 0usize;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(3, '|');
            let (name, cookie, remark) = match (parts.next(), parts.next(), parts.next()) {
                (Some(cookie), None, None) => (None, cookie, ""),
                (Some(name), Some(cookie), None) => (Some(name), cookie, ""),
                (Some(name), Some(cookie), Some(remark)) => (Some(name), cookie, remark),
                _ => continue,
            };
            if self.add(cookie, name, remark)?.is_some() {
                added += 1;
            }
        }
        tracing::info!(added, "credentials imported from file");
        Ok(added)
    }

    /// Load credentials from the `COOKIES` environment variable
    /// (double-newline separated), typically populated via `.env`.
    pub fn import_env(&self) -> Result<usize> {
        let Ok(raw) = std::env::var("COOKIES") else {
            return Ok(0);
        };
        let mut added = 0usize;
        for (i, cookie) in raw.split("\n\n").enumerate() {
            let cookie = cookie.trim();
            if cookie.is_empty() {
                continue;
            }
            let name = format!("env_account_{}", i + 1);
            if self.add(cookie, Some(&name), "")?.is_some() {
                added += 1;
            }
        }
        tracing::info!(added, "credentials imported from COOKIES env");
        Ok(added)
    }

    pub fn acquire(&self) -> Option<Lease> {
        self.acquire_excluding(&BTreeSet::new())
    }

    /// Atomic selection under the lock: filter ineligible records, choose by
    /// strategy, stamp usage counters, persist. `exclude` lets the retry
    /// driver skip fingerprints it has already tried for the current request.
    pub fn acquire_excluding(&self, exclude: &BTreeSet<String>) -> Option<Lease> {
        let now = Utc::now();
        let mut state = self.state.lock().expect("pool lock");

        let mut eligible: Vec<String> = Vec::new();
        for (fp, cred) in state.accounts.iter_mut() {
            if exclude.contains(fp) {
                continue;
            }
            match cred.eligibility(now) {
                None => eligible.push(fp.clone()),
                Some(reason) => {
                    tracing::debug!(name = %cred.name, %reason, "credential ineligible");
                }
            }
        }

        if eligible.is_empty() {
            tracing::warn!("no eligible credential in pool");
            return None;
        }

        let chosen_fp = match state.strategy {
            Strategy::RoundRobin => {
                // Monotonic cursor modulo the eligible list ordered by
                // fingerprint (BTreeMap iteration order).
                let idx = (state.rotation_cursor % eligible.len() as u64) as usize;
                state.rotation_cursor = state.rotation_cursor.wrapping_add(1);
                eligible[idx].clone()
            }
            Strategy::Random => {
                let idx = rand::thread_rng().gen_range(0..eligible.len());
                eligible[idx].clone()
            }
            Strategy::LeastUsed => eligible
                .iter()
                .min_by_key(|fp| {
                    let cred = &state.accounts[*fp];
                    // Fewest uses today; ties go to the longest-idle record.
                    (cred.daily_use_count, cred.last_use_time)
                })
                .cloned()
                .expect("eligible list is non-empty"),
        };

        let cred = state
            .accounts
            .get_mut(&chosen_fp)
            .expect("chosen credential exists");
        cred.last_use_time = Some(now);
        cred.use_count += 1;
        cred.daily_use_count += 1;
        let lease = Lease {
            fingerprint: cred.fingerprint.clone(),
            name: cred.name.clone(),
            cookie_str: cred.cookie_str.clone(),
        };
        tracing::debug!(name = %lease.name, today = cred.daily_use_count, "credential acquired");

        if let Err(err) = self.persist(&state) {
            tracing::error!(error = %err, "failed to persist pool after acquire");
        }
        Some(lease)
    }

    pub fn report_success(&self, fingerprint: &str) {
        let mut state = self.state.lock().expect("pool lock");
        if let Some(cred) = state.accounts.get_mut(fingerprint) {
            cred.success_count += 1;
            cred.error_count = cred.error_count.saturating_sub(1);
        }
        if let Err(err) = self.persist(&state) {
            tracing::error!(error = %err, "failed to persist pool after success");
        }
    }

    /// Credit completed notes to the credential that finished them.
    pub fn credit_notes(&self, fingerprint: &str, notes: u64) {
        let mut state = self.state.lock().expect("pool lock");
        if let Some(cred) = state.accounts.get_mut(fingerprint) {
            cred.total_notes += notes;
        }
        if let Err(err) = self.persist(&state) {
            tracing::error!(error = %err, "failed to persist pool after crediting notes");
        }
    }

    pub fn report_failure(&self, fingerprint: &str, reason: &str) {
        let mut state = self.state.lock().expect("pool lock");
        if let Some(cred) = state.accounts.get_mut(fingerprint) {
            cred.fail_count += 1;
            cred.error_count += 1;

            if cred.error_count >= SOFT_COOLDOWN_THRESHOLD {
                let minutes = (cred.error_count as i64 * COOLDOWN_STEP_MINUTES)
                    .min(COOLDOWN_CAP_MINUTES);
                cred.cooldown_until = Some(Utc::now() + chrono::Duration::minutes(minutes));
                tracing::warn!(
                    name = %cred.name,
                    errors = cred.error_count,
                    cooldown_minutes = minutes,
                    "credential cooling down"
                );
            }
            if cred.error_count >= HARD_DISABLE_THRESHOLD {
                cred.is_active = false;
                tracing::error!(name = %cred.name, "credential disabled after repeated errors");
            }
            tracing::warn!(name = %cred.name, reason, "credential failure recorded");
        }
        if let Err(err) = self.persist(&state) {
            tracing::error!(error = %err, "failed to persist pool after failure");
        }
    }

    /// Clear cooldown, error counters and the daily counter; reactivate.
    pub fn reset(&self, fingerprint: &str) -> Result<bool> {
        let mut state = self.state.lock().expect("pool lock");
        let Some(cred) = state.accounts.get_mut(fingerprint) else {
            return Ok(false);
        };
        cred.is_active = true;
        cred.error_count = 0;
        cred.cooldown_until = None;
        cred.daily_use_count = 0;
        tracing::info!(name = %cred.name, "credential reset");
        self.persist(&state)?;
        Ok(true)
    }

    pub fn reset_all(&self) -> Result<usize> {
        let fps: Vec<String> = {
            let state = self.state.lock().expect("pool lock");
            state.accounts.keys().cloned().collect()
        };
        for fp in &fps {
            self.reset(fp)?;
        }
        Ok(fps.len())
    }

    /// Put a credential into cooldown for a fixed duration.
    #[allow(dead_code)]
    pub fn set_cooldown(&self, fingerprint: &str, duration: Duration) -> Result<bool> {
        let mut state = self.state.lock().expect("pool lock");
        let Some(cred) = state.accounts.get_mut(fingerprint) else {
            return Ok(false);
        };
        let span = chrono::Duration::from_std(duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        cred.cooldown_until = Some(Utc::now() + span);
        self.persist(&state)?;
        Ok(true)
    }

    pub fn set_strategy(&self, strategy: Strategy) -> Result<()> {
        let mut state = self.state.lock().expect("pool lock");
        state.strategy = strategy;
        tracing::info!(%strategy, "rotation strategy updated");
        self.persist(&state)
    }

    /// Update `daily_limit` / `min_interval` for one credential, or for all
    /// of them when `fingerprint` is None.
    pub fn tune(
        &self,
        fingerprint: Option<&str>,
        daily_limit: Option<u32>,
        min_interval: Option<u64>,
    ) -> Result<usize> {
        let mut state = self.state.lock().expect("pool lock");
        let mut touched = 0usize;
        for (fp, cred) in state.accounts.iter_mut() {
            if let Some(target) = fingerprint {
                if fp != target {
                    continue;
                }
            }
            if let Some(limit) = daily_limit {
                cred.daily_limit = limit;
            }
            if let Some(interval) = min_interval {
                cred.min_interval = interval;
            }
            touched += 1;
        }
        if touched > 0 {
            self.persist(&state)?;
        }
        Ok(touched)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let now = Utc::now();
        let mut state = self.state.lock().expect("pool lock");
        let strategy = state.strategy;
        let mut accounts: Vec<Credential> = Vec::with_capacity(state.accounts.len());
        let mut active = 0usize;
        let mut available = 0usize;
        for cred in state.accounts.values_mut() {
            if cred.is_active {
                active += 1;
            }
            if cred.eligibility(now).is_none() {
                available += 1;
            }
            accounts.push(cred.clone());
        }
        PoolSnapshot {
            strategy,
            total: accounts.len(),
            active,
            available,
            accounts,
        }
    }

    /// Flush the pool to its config file: write a temp file, then rename.
    fn persist(&self, state: &PoolState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    eyre!("failed to create config directory {}: {e}", parent.display())
                })?;
            }
        }
        let file = PoolFile {
            strategy: state.strategy,
            accounts: state.accounts.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| eyre!("failed to serialize credential pool: {e}"))?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .map_err(|e| eyre!("failed to write temp config {}: {e}", tmp_path.display()))?;
        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            if cfg!(windows) {
                let _ = fs::remove_file(&self.path);
                fs::rename(&tmp_path, &self.path).map_err(|e| {
                    eyre!("failed to replace config {}: {e}", self.path.display())
                })?;
            } else {
                return Err(eyre!(
                    "failed to replace config {}: {err}",
                    self.path.display()
                ));
            }
        }
        Ok(())
    }
}
