//! On-disk storage of captured messages

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// Writes each message to its own file in a directory.
///
/// Files are named after the second the message arrived (`YYYYMMDDHHMMSS`)
/// followed by a counter, starting at 0, that keeps names unique within that
/// second.
#[derive(Debug, Clone)]
pub struct MailStore {
    dir: PathBuf,
}

impl MailStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory (and its parents) if it does not exist yet
    pub fn create_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Store a message under the name slot for `received_at`.
    ///
    /// Name selection relies on exclusive creation, so concurrent writers in
    /// the same second each get their own suffix.
    pub fn store_at(&self, received_at: DateTime<Local>, body: &[u8]) -> io::Result<PathBuf> {
        let base = received_at.format("%Y%m%d%H%M%S").to_string();

        let mut suffix: u64 = 0;
        loop {
            let path = self.dir.join(format!("{base}{suffix}"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(body).and_then(|()| file.flush()) {
                        drop(file);
                        let _ = fs::remove_file(&path);
                        return Err(e);
                    }
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2016, 3, 7, 14, 5, 9).unwrap()
    }

    #[test]
    fn test_store_writes_body_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let store = MailStore::new(dir.path());

        let body = b"Subject: hi\n\nhello\xff";
        let path = store.store_at(fixed_time(), body).unwrap();

        assert_eq!(path, dir.path().join("201603071405090"));
        assert_eq!(fs::read(&path).unwrap(), body);
    }

    #[test]
    fn test_suffixes_increase_within_a_second() {
        let dir = tempfile::tempdir().unwrap();
        let store = MailStore::new(dir.path());

        let names: Vec<String> = (0..3)
            .map(|i| {
                let path = store.store_at(fixed_time(), format!("{i}").as_bytes()).unwrap();
                path.file_name().unwrap().to_string_lossy().into_owned()
            })
            .collect();

        assert_eq!(
            names,
            vec!["201603071405090", "201603071405091", "201603071405092"]
        );
        assert_eq!(fs::read(dir.path().join("201603071405091")).unwrap(), b"1");
    }

    #[test]
    fn test_existing_files_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("201603071405090"), b"older").unwrap();
        let store = MailStore::new(dir.path());

        let path = store.store_at(fixed_time(), b"newer").unwrap();

        assert_eq!(path, dir.path().join("201603071405091"));
        assert_eq!(fs::read(dir.path().join("201603071405090")).unwrap(), b"older");
    }

    #[test]
    fn test_concurrent_same_second_writes() {
        const WRITERS: usize = 16;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MailStore::new(dir.path()));

        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .store_at(fixed_time(), format!("message {i}").as_bytes())
                        .unwrap()
                })
            })
            .collect();

        let paths: HashSet<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(paths.len(), WRITERS);

        let expected: HashSet<PathBuf> = (0..WRITERS)
            .map(|i| dir.path().join(format!("20160307140509{i}")))
            .collect();
        assert_eq!(paths, expected);

        let contents: HashSet<Vec<u8>> = paths.iter().map(|p| fs::read(p).unwrap()).collect();
        assert_eq!(contents.len(), WRITERS);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = MailStore::new(dir.path().join("missing"));

        assert!(store.store_at(fixed_time(), b"lost").is_err());

        store.create_dir().unwrap();
        assert!(store.store_at(fixed_time(), b"kept").is_ok());
    }
}
