//! File-backed session persistence: one opaque handle, one file.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::domain::SessionHandle;
use crate::provider::port::SessionStore;
use crate::Result;

#[derive(Clone, Debug)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, handle: &SessionHandle) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, handle.0.as_bytes())?;
        Ok(())
    }

    fn load(&self) -> Result<Option<SessionHandle>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let raw = raw.trim();
                if raw.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(SessionHandle(raw.to_string())))
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn tmp_file(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_millis();
        let pid = std::process::id();
        PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}.session"))
    }

    #[test]
    fn round_trips_a_handle() {
        let store = FileSessionStore::new(tmp_file("volley-store-test"));
        store.save(&SessionHandle("abc123".into())).unwrap();
        assert_eq!(store.load().unwrap(), Some(SessionHandle("abc123".into())));

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn missing_file_loads_as_none() {
        let store = FileSessionStore::new(tmp_file("volley-store-missing"));
        assert_eq!(store.load().unwrap(), None);
        // clearing something that was never saved is not an error
        store.clear().unwrap();
    }
}
