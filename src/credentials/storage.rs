//! Credential store backed by a single JSON document.
//!
//! Stores every credential record for every provider and account. Each `put`
//! reads the entire document, replaces one entry and writes the entire
//! document back. An absent or unreadable document is an empty store.

use super::encryption::{DocumentCipher, Envelope};
use super::{CredentialKey, CredentialRecord, KeyGuard, KeyLocks};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, warn};

/// Current document schema version.
pub const DOCUMENT_VERSION: u32 = 1;

/// On-disk document.
///
/// ```json
/// {
///   "version": 1,
///   "credentials": {
///     "gmail": { "kind": "oauth_refreshable", ... },
///     "gmail:work": { "kind": "oauth_refreshable", ... },
///     "canvas": { "kind": "browser_session", ... }
///   }
/// }
/// ```
#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    /// Missing in hand-written documents, read as version 1
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    credentials: BTreeMap<String, CredentialRecord>,
}

fn default_version() -> u32 {
    DOCUMENT_VERSION
}

/// Result of reading the backing document.
enum Loaded {
    Missing,
    Ok(Document),
    /// Present but not parseable (or wrong key); treated as empty
    Unreadable,
}

/// Durable keyed storage for opaque credential records.
///
/// # Thread Safety
/// - Document rewrites are serialised by an in-process mutex held only for
///   the duration of the file IO, never across network calls
/// - Read-modify-write sequences on one record take the per-key guard from
///   [`lock_key`](Self::lock_key)
pub struct CredentialStore {
    path: PathBuf,
    cipher: Option<DocumentCipher>,
    write_lock: Mutex<()>,
    key_locks: KeyLocks,
}

impl CredentialStore {
    /// Opens a plain-JSON store at `path`. The file is created on first write.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cipher: None,
            write_lock: Mutex::new(()),
            key_locks: KeyLocks::new(),
        }
    }

    /// Opens a store whose document is sealed with AES-256-GCM.
    ///
    /// # Arguments
    /// * `path` - Path to the credential document
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn with_encryption<P: AsRef<Path>>(path: P, encryption_key: &str) -> Result<Self> {
        let cipher = DocumentCipher::from_base64(encryption_key).context("Invalid encryption key")?;
        let mut store = Self::new(path);
        store.cipher = Some(cipher);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Retrieves the record stored under `key`.
    pub fn get(&self, key: &CredentialKey) -> Option<CredentialRecord> {
        match self.load() {
            Loaded::Ok(mut doc) => doc.credentials.remove(&key.to_document_key()),
            Loaded::Missing | Loaded::Unreadable => None,
        }
    }

    /// Stores `record` under `key`, replacing any previous record.
    ///
    /// The whole document is rewritten atomically (temp file, fsync, rename).
    pub fn put(&self, key: &CredentialKey, record: &CredentialRecord) -> Result<()> {
        let _write = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut doc = match self.load() {
            Loaded::Ok(doc) => doc,
            Loaded::Missing => Document::default(),
            Loaded::Unreadable => {
                self.quarantine_unreadable()?;
                Document::default()
            }
        };

        doc.version = DOCUMENT_VERSION;
        doc.credentials
            .insert(key.to_document_key(), record.clone());
        self.write_document(&doc)?;

        debug!(
            provider = %key.provider,
            account = %key.account,
            kind = ?record.kind(),
            "Credential record written"
        );
        Ok(())
    }

    /// Accounts with a record for `provider`. The sentinel key is reported as
    /// `"default"`; every other account exactly once, in sorted order.
    pub fn list_accounts(&self, provider: &str) -> BTreeSet<String> {
        self.list_all()
            .into_iter()
            .filter(|key| key.provider == provider)
            .map(|key| key.account)
            .collect()
    }

    /// Every key present in the document.
    pub fn list_all(&self) -> Vec<CredentialKey> {
        match self.load() {
            Loaded::Ok(doc) => doc
                .credentials
                .keys()
                .map(|raw| CredentialKey::from_document_key(raw))
                .collect(),
            Loaded::Missing | Loaded::Unreadable => Vec::new(),
        }
    }

    /// Waits for the per-key flow guard of `key`.
    pub async fn lock_key(&self, key: &CredentialKey) -> KeyGuard {
        self.key_locks.acquire(key).await
    }

    fn load(&self) -> Loaded {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Loaded::Missing,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Credential document unreadable");
                return Loaded::Unreadable;
            }
        };

        if raw.trim().is_empty() {
            return Loaded::Missing;
        }

        match self.parse(&raw) {
            Ok(doc) => Loaded::Ok(doc),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Credential document unreadable, treating as empty");
                Loaded::Unreadable
            }
        }
    }

    fn parse(&self, raw: &str) -> Result<Document> {
        match (Envelope::detect(raw), &self.cipher) {
            (Some(envelope), Some(cipher)) => {
                let plaintext = cipher.open(&envelope)?;
                serde_json::from_slice(&plaintext).context("Failed to parse decrypted document")
            }
            (Some(_), None) => anyhow::bail!("Document is encrypted but no encryption key is configured"),
            (None, _) => serde_json::from_str(raw).context("Failed to parse credential document"),
        }
    }

    fn write_document(&self, doc: &Document) -> Result<()> {
        let json = serde_json::to_vec_pretty(doc).context("Failed to serialize credential document")?;

        let contents = match &self.cipher {
            Some(cipher) => {
                let envelope = cipher.seal(DOCUMENT_VERSION, &json)?;
                serde_json::to_vec_pretty(&envelope).context("Failed to serialize envelope")?
            }
            None => json,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create credential directory")?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path).context("Failed to create temporary credential file")?;
            file.write_all(&contents)
                .context("Failed to write credential document")?;
            file.sync_all()
                .context("Failed to sync credential document to disk")?;
        }

        fs::rename(&tmp_path, &self.path).context("Failed to rename temporary credential file")?;
        Ok(())
    }

    /// Moves an unreadable document aside before it is overwritten, so an
    /// operator can still recover it by hand.
    fn quarantine_unreadable(&self) -> Result<()> {
        let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let backup = self.path.with_extension(format!("corrupt-{}", timestamp));
        fs::rename(&self.path, &backup).context("Failed to move unreadable credential document aside")?;
        error!(
            path = %self.path.display(),
            backup = %backup.display(),
            "Unreadable credential document moved aside before rewrite"
        );
        Ok(())
    }
}
