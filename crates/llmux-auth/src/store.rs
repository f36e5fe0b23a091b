use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::auth_file::AuthFile;
use crate::entity::Auth;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("token store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("token store encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Durable persistence for auth records.
///
/// Injected into the manager at construction; there is no process-wide
/// default store.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn save(&self, auth: &Auth) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<Auth>, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Stores one JSON file per auth under a root directory.
///
/// Writes are atomic (temp + rename) with file mode 0600 under a 0700
/// directory, and skipped entirely when the marshalled bytes already match
/// what is on disk.
pub struct FileTokenStore {
    root: PathBuf,
}

impl FileTokenStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn save(&self, auth: &Auth) -> Result<(), StoreError> {
        let file_name = if auth.file_name.is_empty() {
            format!("{}.json", auth.id)
        } else {
            auth.file_name.clone()
        };
        let path = self.path_for(&file_name);
        let file = AuthFile::from_auth(auth);
        let mut bytes = serde_json::to_vec_pretty(&file)?;
        bytes.push(b'\n');

        if let Ok(existing) = tokio::fs::read(&path).await
            && existing == bytes
        {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perm = std::fs::Permissions::from_mode(0o700);
                tokio::fs::set_permissions(parent, perm).await?;
            }
        }

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perm = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp, perm).await?;
        }
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Auth>, StoreError> {
        let mut auths = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let bytes = tokio::fs::read(&path).await?;
                let Ok(file) = AuthFile::parse(&bytes) else {
                    tracing::warn!(path = %path.display(), "skipping unparseable auth file");
                    continue;
                };
                let rel = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                auths.push(file.to_auth(&rel, &rel));
            }
        }
        auths.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(auths)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::AuthStatus;

    fn sample_auth(id: &str) -> Auth {
        let mut auth = Auth {
            id: id.to_string(),
            provider: "codex".to_string(),
            file_name: format!("{id}.json"),
            label: "a@example.com".to_string(),
            status: AuthStatus::Active,
            ..Auth::default()
        };
        auth.metadata
            .insert("email".to_string(), serde_json::json!("a@example.com"));
        auth.metadata
            .insert("access_token".to_string(), serde_json::json!("at"));
        auth.ensure_index();
        auth
    }

    #[tokio::test]
    async fn save_list_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());

        store.save(&sample_auth("codex-a")).await.unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "codex-a.json");
        assert_eq!(listed[0].provider, "codex");

        store.delete("codex-a.json").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        // Deleting again is not an error.
        store.delete("codex-a.json").await.unwrap();
    }

    #[tokio::test]
    async fn identical_save_does_not_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        let auth = sample_auth("codex-a");

        store.save(&auth).await.unwrap();
        let path = dir.path().join("codex-a.json");
        let before = std::fs::metadata(&path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        store.save(&auth).await.unwrap();
        let after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn written_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("auths"));
        store.save(&sample_auth("codex-a")).await.unwrap();
        let mode = std::fs::metadata(dir.path().join("auths/codex-a.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(dir.path().join("auths"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
