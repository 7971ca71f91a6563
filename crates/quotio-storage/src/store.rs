use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use quotio_provider_core::{CredentialSink, StoredCredential};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("invalid credential file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid credential id: {0:?}")]
    InvalidId(String),
}

/// One JSON document per credential under `<data_dir>/auth/`.
///
/// Writes go through a temp file in the same directory followed by a rename,
/// so a crash mid-write never leaves a torn document. The file carries OAuth
/// tokens, so it is chmod 0600 on unix.
pub struct FileCredentialStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let dir = data_dir.join("auth");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read every credential file. Unparseable files are skipped with a
    /// warning rather than failing startup.
    pub async fn load_all(&self) -> Result<Vec<StoredCredential>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut out: HashMap<String, StoredCredential> = HashMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<StoredCredential>(&contents) {
                Ok(cred) if !cred.id.is_empty() => {
                    out.insert(cred.id.clone(), cred);
                }
                Ok(_) => {
                    warn!(event = "credential_skipped", path = %path.display(), reason = "empty id");
                }
                Err(err) => {
                    warn!(event = "credential_skipped", path = %path.display(), error = %err);
                }
            }
        }
        let mut list: Vec<StoredCredential> = out.into_values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        info!(event = "credentials_loaded", dir = %self.dir.display(), count = list.len());
        Ok(list)
    }

    pub async fn save(&self, cred: &StoredCredential) -> Result<(), StoreError> {
        let path = self.path_for(&cred.id)?;
        let json = serde_json::to_string_pretty(cred).map_err(|err| StoreError::Parse {
            path: path.clone(),
            message: err.to_string(),
        })?;
        let _guard = self.write_lock.lock().await;
        write_atomic(&path, json.as_bytes()).await?;
        debug!(event = "credential_persisted", id = %cred.id, path = %path.display());
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.path_for(id)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        // Ids become file names; anything that could escape the directory is
        // rejected outright.
        if id.is_empty()
            || id
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            || id.starts_with('.')
        {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl CredentialSink for FileCredentialStore {
    async fn persist(&self, auth: &StoredCredential) -> io::Result<()> {
        self.save(auth)
            .await
            .map_err(|err| io::Error::other(err.to_string()))
    }

    async fn remove(&self, id: &str) -> io::Result<()> {
        self.delete(id)
            .await
            .map(|_| ())
            .map_err(|err| io::Error::other(err.to_string()))
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::other("credential path has no parent directory"))?;
    let tmp_path = dir.join(format!(".tmp.{}", std::process::id()));
    tokio::fs::write(&tmp_path, data).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms).await?;
    }

    tokio::fs::rename(&tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotio_provider_core::AuthStatus;

    fn credential(id: &str) -> StoredCredential {
        let mut cred = StoredCredential::new(id, "claude");
        cred.access_token = Some(format!("at_{id}"));
        cred.refresh_token = Some(format!("rt_{id}"));
        cred
    }

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).await.unwrap();
        store.save(&credential("acct-1")).await.unwrap();
        store.save(&credential("acct-2")).await.unwrap();

        let reopened = FileCredentialStore::open(dir.path()).await.unwrap();
        let loaded = reopened.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "acct-1");
        assert_eq!(loaded[0].access_token.as_deref(), Some("at_acct-1"));
        assert_eq!(loaded[1].id, "acct-2");
    }

    #[tokio::test]
    async fn save_overwrites_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).await.unwrap();
        store.save(&credential("acct-1")).await.unwrap();

        let mut updated = credential("acct-1");
        updated.status = AuthStatus::Error;
        updated.status_message = Some("refresh failed".to_string());
        store.save(&updated).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, AuthStatus::Error);
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).await.unwrap();
        store.save(&credential("acct-1")).await.unwrap();

        assert!(store.delete("acct-1").await.unwrap());
        assert!(!store.delete("acct-1").await.unwrap());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_path_escaping_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).await.unwrap();
        for id in ["../evil", "a/b", "", ".hidden"] {
            let mut cred = credential("x");
            cred.id = id.to_string();
            assert!(
                matches!(store.save(&cred).await, Err(StoreError::InvalidId(_))),
                "{id:?}"
            );
        }
    }

    #[tokio::test]
    async fn corrupt_files_are_skipped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).await.unwrap();
        store.save(&credential("good")).await.unwrap();
        tokio::fs::write(store.dir().join("bad.json"), b"{not json")
            .await
            .unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "good");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn credential_files_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).await.unwrap();
        store.save(&credential("acct-1")).await.unwrap();

        let metadata = tokio::fs::metadata(store.dir().join("acct-1.json"))
            .await
            .unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }
}
