//! Timer jobs that run mailbox scans on each webhook's cron pattern.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Local;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::pattern::{job_key, parse_schedule, CronSchedule};
use crate::accounts::{Account, AccountProvider};
use crate::mailbox::DEFAULT_SEQUENCE;
use crate::sync::{MailboxSynchronizer, MessageOutcome, RunError, RunOptions};

/// Registry of cron jobs plus the on-demand run entry points.
pub struct CronScheduler {
    accounts: Arc<dyn AccountProvider>,
    synchronizer: Arc<MailboxSynchronizer>,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(accounts: Arc<dyn AccountProvider>, synchronizer: Arc<MailboxSynchronizer>) -> Self {
        Self {
            accounts,
            synchronizer,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Register a job for every enabled webhook cron of `accounts`.
    ///
    /// Invalid patterns are logged and skipped. Already registered keys are
    /// left alone, so calling this twice is harmless. Returns the number of
    /// jobs added.
    pub fn initialize(&self, accounts: &[Account]) -> usize {
        let mut added = 0;

        for account in accounts {
            info!(account_id = %account.id, "cron_account_starting");

            for (index, webhook) in account.webhooks.iter().enumerate() {
                let cron = match &webhook.cron {
                    Some(cron) if webhook.enabled && cron.enabled => cron,
                    _ => continue,
                };
                let seq = cron.seq.clone().unwrap_or_else(|| DEFAULT_SEQUENCE.to_string());

                let schedule = match parse_schedule(&cron.pattern) {
                    Ok(schedule) => schedule,
                    Err(e) => {
                        warn!(
                            account_id = %account.id,
                            webhook_id = %webhook.id,
                            pattern = %cron.pattern,
                            seq = %seq,
                            error = %e,
                            "cron_pattern_invalid"
                        );
                        continue;
                    }
                };

                let key = job_key(&account.id, index, &cron.pattern);
                if self.register(key, schedule, &account.id, seq) {
                    added += 1;
                }
            }
        }

        added
    }

    /// Start the job `key` unless one with that key already runs.
    fn register(&self, key: String, schedule: CronSchedule, account_id: &str, seq: String) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&key) {
            warn!(job = %key, account_id = %account_id, seq = %seq, "cron_already_registered");
            return false;
        }

        let handle = tokio::spawn(run_job(
            key.clone(),
            schedule,
            account_id.to_string(),
            seq.clone(),
            Arc::clone(&self.accounts),
            Arc::clone(&self.synchronizer),
        ));
        info!(job = %key, account_id = %account_id, seq = %seq, "cron_registered");
        jobs.insert(key, handle);
        true
    }

    /// Keys of the registered jobs, sorted.
    pub fn job_keys(&self) -> Vec<String> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = jobs.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Run a scan for every configured account, one after another.
    ///
    /// Results are keyed by account id. An account whose scan fails makes the
    /// whole call fail.
    pub async fn run_all(
        &self,
        seq: &str,
        options: &RunOptions,
    ) -> Result<BTreeMap<String, Vec<MessageOutcome>>, RunError> {
        let file = self.accounts.accounts().await?;
        let mut results = BTreeMap::new();

        for account in &file.accounts {
            let outcomes = self.synchronizer.process(account, seq, options).await?;
            results.insert(account.id.clone(), outcomes);
        }

        Ok(results)
    }

    /// Run a scan for one account.
    pub async fn run_account(
        &self,
        account_id: &str,
        seq: &str,
        options: &RunOptions,
    ) -> Result<Vec<MessageOutcome>, RunError> {
        let account = self.accounts.account(account_id).await?;
        self.synchronizer.process(&account, seq, options).await
    }

    /// Stop every job. Scans already underway are aborted at their next await.
    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, handle) in jobs.drain() {
            handle.abort();
            info!(job = %key, "cron_stopped");
        }
    }
}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Fire `schedule` forever, scanning INBOX of `account_id` each time.
///
/// The account is looked up at every firing so configuration edits apply
/// without re-registering.
async fn run_job(
    key: String,
    schedule: CronSchedule,
    account_id: String,
    seq: String,
    accounts: Arc<dyn AccountProvider>,
    synchronizer: Arc<MailboxSynchronizer>,
) {
    loop {
        let next = match schedule.next_after(&Local::now()) {
            Some(next) => next,
            None => {
                info!(job = %key, "cron_schedule_exhausted");
                return;
            }
        };
        let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        info!(job = %key, account_id = %account_id, seq = %seq, "cron_triggered");

        let account = match accounts.account(&account_id).await {
            Ok(account) => account,
            Err(e) => {
                warn!(job = %key, account_id = %account_id, error = %e, "cron_account_unavailable");
                continue;
            }
        };

        match synchronizer
            .process(&account, &seq, &RunOptions::scheduled())
            .await
        {
            Ok(outcomes) => info!(
                job = %key,
                account_id = %account_id,
                messages = outcomes.len(),
                "cron_run_complete"
            ),
            Err(e) => error!(job = %key, account_id = %account_id, error = %e, "cron_run_failed"),
        }
    }
}
