//! Filesystem access as a trait, so the dirtiness evaluator and builder can
//! run against an in-memory double in tests.

use std::path::Path;

use crate::graph::MTime;

pub trait DiskInterface: Send + Sync {
    fn stat(&self, path: &str) -> MTime;
    fn read_file(&self, path: &str) -> std::io::Result<String>;
    fn write_file(&self, path: &str, content: &str) -> std::io::Result<()>;
    fn make_dirs(&self, path: &str) -> std::io::Result<()>;
    fn remove_file(&self, path: &str) -> std::io::Result<()>;
}

/// The real filesystem, rooted wherever the process's cwd happens to be
/// (the driver binary chdirs via `-C` before constructing one of these).
pub struct RealDiskInterface;

impl DiskInterface for RealDiskInterface {
    fn stat(&self, path: &str) -> MTime {
        match std::fs::metadata(path) {
            Ok(meta) => match meta.modified() {
                Ok(t) => match t.duration_since(std::time::UNIX_EPOCH) {
                    Ok(d) => MTime::Stamp(d.as_secs() as i64),
                    Err(_) => MTime::Stamp(0),
                },
                Err(_) => MTime::Unknown,
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MTime::Missing,
            Err(_) => MTime::Unknown,
        }
    }

    fn read_file(&self, path: &str) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write_file(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(path, content)
    }

    fn make_dirs(&self, path: &str) -> std::io::Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn remove_file(&self, path: &str) -> std::io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeDisk {
        files: Mutex<HashMap<String, (String, i64)>>,
    }

    impl FakeDisk {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&self, path: &str, content: &str, mtime: i64) {
            self.files.lock().unwrap().insert(path.to_string(), (content.to_string(), mtime));
        }

        pub fn touch(&self, path: &str, mtime: i64) {
            let mut files = self.files.lock().unwrap();
            let entry = files.entry(path.to_string()).or_insert_with(|| (String::new(), mtime));
            entry.1 = mtime;
        }
    }

    impl DiskInterface for FakeDisk {
        fn stat(&self, path: &str) -> MTime {
            match self.files.lock().unwrap().get(path) {
                Some((_, mtime)) => MTime::Stamp(*mtime),
                None => MTime::Missing,
            }
        }

        fn read_file(&self, path: &str) -> std::io::Result<String> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .map(|(c, _)| c.clone())
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()))
        }

        fn write_file(&self, path: &str, content: &str) -> std::io::Result<()> {
            let mut files = self.files.lock().unwrap();
            let mtime = files.get(path).map(|(_, m)| *m + 1).unwrap_or(1);
            files.insert(path.to_string(), (content.to_string(), mtime));
            Ok(())
        }

        fn make_dirs(&self, _path: &str) -> std::io::Result<()> {
            Ok(())
        }

        fn remove_file(&self, path: &str) -> std::io::Result<()> {
            self.files.lock().unwrap().remove(path);
            Ok(())
        }
    }

    #[test]
    fn fake_disk_tracks_mtimes() {
        let d = FakeDisk::new();
        d.set("a", "hi", 5);
        assert_eq!(d.stat("a"), MTime::Stamp(5));
        assert_eq!(d.stat("missing"), MTime::Missing);
    }
}
