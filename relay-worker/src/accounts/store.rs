//! YAML-backed account store with a time-bounded read-through cache.
//!
//! The cache holds one parsed copy of the file. Reads reuse it until the TTL
//! expires; a successful write replaces it directly, so readers may observe
//! the old contents for at most one TTL when the file is edited out of band.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Account, AccountsFile, FieldError};

#[derive(Debug, Error)]
pub enum AccountsError {
    #[error("failed to access accounts file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse accounts file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid accounts: {}", join_errors(.0))]
    Invalid(Vec<FieldError>),

    #[error("account not found: {0}")]
    NotFound(String),
}

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Read access to the configured accounts.
#[async_trait]
pub trait AccountProvider: Send + Sync {
    /// Current snapshot of every account.
    async fn accounts(&self) -> Result<Arc<AccountsFile>, AccountsError>;

    /// One account by id.
    async fn account(&self, id: &str) -> Result<Account, AccountsError> {
        let file = self.accounts().await?;
        file.accounts
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| AccountsError::NotFound(id.to_string()))
    }
}

struct CachedFile {
    loaded_at: Instant,
    file: Arc<AccountsFile>,
}

/// Accounts file on disk plus its cached parse.
pub struct AccountStore {
    path: PathBuf,
    ttl: Duration,
    cache: RwLock<Option<CachedFile>>,
}

impl AccountStore {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the cached file, reading and validating it when absent or expired.
    pub async fn load(&self) -> Result<Arc<AccountsFile>, AccountsError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.loaded_at.elapsed() < self.ttl {
                    debug!(path = %self.path.display(), "accounts_cache_hit");
                    return Ok(Arc::clone(&cached.file));
                }
            }
        }

        let mut cache = self.cache.write().await;

        // Another reader may have refreshed it while we waited for the write lock
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&cached.file));
            }
        }

        let file = Arc::new(self.read_from_disk().await?);
        *cache = Some(CachedFile {
            loaded_at: Instant::now(),
            file: Arc::clone(&file),
        });

        info!(
            path = %self.path.display(),
            accounts = file.accounts.len(),
            "accounts_file_loaded"
        );

        Ok(file)
    }

    /// Drop the cached copy so the next read goes to disk.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Validate and persist `file`, then make it the cached copy.
    pub async fn save(&self, file: AccountsFile) -> Result<Arc<AccountsFile>, AccountsError> {
        if let Err(errors) = file.validate() {
            warn!(
                path = %self.path.display(),
                errors = %join_errors(&errors),
                "accounts_file_write_rejected"
            );
            return Err(AccountsError::Invalid(errors));
        }

        let yaml = serde_yaml::to_string(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| AccountsError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        tokio::fs::write(&self.path, yaml)
            .await
            .map_err(|source| AccountsError::Io {
                path: self.path.clone(),
                source,
            })?;

        let file = Arc::new(file);
        *self.cache.write().await = Some(CachedFile {
            loaded_at: Instant::now(),
            file: Arc::clone(&file),
        });

        info!(
            path = %self.path.display(),
            accounts = file.accounts.len(),
            "accounts_file_written"
        );

        Ok(file)
    }

    pub async fn list(&self) -> Result<Vec<Account>, AccountsError> {
        Ok(self.load().await?.accounts.clone())
    }

    pub async fn get(&self, id: &str) -> Result<Account, AccountsError> {
        self.account(id).await
    }

    /// Insert `account`, or replace the existing account with the same id.
    pub async fn upsert(&self, account: Account) -> Result<Account, AccountsError> {
        let mut file = (*self.load().await?).clone();
        match file.accounts.iter_mut().find(|a| a.id == account.id) {
            Some(existing) => *existing = account.clone(),
            None => file.accounts.push(account.clone()),
        }
        self.save(file).await?;
        Ok(account)
    }

    /// Remove an account and return it.
    pub async fn remove(&self, id: &str) -> Result<Account, AccountsError> {
        let mut file = (*self.load().await?).clone();
        let position = file
            .accounts
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| AccountsError::NotFound(id.to_string()))?;
        let removed = file.accounts.remove(position);
        self.save(file).await?;
        Ok(removed)
    }

    async fn read_from_disk(&self) -> Result<AccountsFile, AccountsError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AccountsError::Io {
                path: self.path.clone(),
                source,
            })?;

        let file: AccountsFile = serde_yaml::from_str(&raw)?;
        file.validate().map_err(AccountsError::Invalid)?;
        Ok(file)
    }
}

#[async_trait]
impl AccountProvider for AccountStore {
    async fn accounts(&self) -> Result<Arc<AccountsFile>, AccountsError> {
        self.load().await
    }
}

/// Fixed in-memory accounts, for embedding and tests.
#[derive(Clone, Default)]
pub struct StaticAccounts {
    file: Arc<AccountsFile>,
}

impl StaticAccounts {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self {
            file: Arc::new(AccountsFile {
                accounts,
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl AccountProvider for StaticAccounts {
    async fn accounts(&self) -> Result<Arc<AccountsFile>, AccountsError> {
        Ok(Arc::clone(&self.file))
    }
}
