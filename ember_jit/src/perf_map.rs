//! Linux `perf` symbol map.
//!
//! Each published unit appends one `<hex addr> <hex size> <name>` line to
//! `perf-<pid>.map` so external profilers can symbolize compiled code.
//! The file is keyed by process id: when a write happens in a process
//! whose id differs from the one the file was opened for (a fork), the
//! parent's file is copied to the child's name and writing continues there.

use crate::unit::CompiledUnit;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

struct PerfMapFile {
    pid: u32,
    file: Option<File>,
}

/// Writer for `perf-<pid>.map` files in one directory.
pub struct PerfMap {
    dir: PathBuf,
    state: Mutex<PerfMapFile>,
}

impl std::fmt::Debug for PerfMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfMap")
            .field("dir", &self.dir)
            .field("pid", &self.state.lock().pid)
            .finish()
    }
}

impl PerfMap {
    /// Perf map in `dir` (usually `/tmp`) for the current process.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(PerfMapFile {
                pid: std::process::id(),
                file: None,
            }),
        }
    }

    /// Path of the map for `pid`.
    pub fn path_for(&self, pid: u32) -> PathBuf {
        self.dir.join(format!("perf-{}.map", pid))
    }

    /// Path of the map currently written.
    pub fn path(&self) -> PathBuf {
        self.path_for(self.state.lock().pid)
    }

    /// Append the entry of `unit`.
    pub fn record(&self, unit: &CompiledUnit) -> io::Result<()> {
        self.write_entry(std::process::id(), unit.entry, unit.size, &unit.full_name)
    }

    fn write_entry(&self, pid: u32, addr: usize, size: usize, name: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.pid != pid {
            state.file = None;
            let parent = self.path_for(state.pid);
            let child = self.path_for(pid);
            if parent.exists() {
                fs::copy(&parent, &child)?;
            }
            tracing::debug!(parent = state.pid, child = pid, "perf map re-keyed after fork");
            state.pid = pid;
        }
        if state.file.is_none() {
            state.file = Some(open_append(&self.path_for(pid))?);
        }
        match state.file.as_mut() {
            Some(file) => writeln!(file, "{:x} {:x} {}", addr, size, name),
            None => Ok(()),
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let map = PerfMap::new(dir.path());
        let pid = std::process::id();
        map.write_entry(pid, 0x1000, 0x20, "__main__:f").unwrap();
        map.write_entry(pid, 0x1020, 0x8, "__main__:g").unwrap();
        let text = fs::read_to_string(map.path()).unwrap();
        assert_eq!(text, "1000 20 __main__:f\n1020 8 __main__:g\n");
    }

    #[test]
    fn test_fork_copies_parent_entries() {
        let dir = tempfile::tempdir().unwrap();
        let map = PerfMap::new(dir.path());
        let parent = std::process::id();
        let child = parent.wrapping_add(1);
        map.write_entry(parent, 0x1000, 0x10, "__main__:f").unwrap();
        map.write_entry(child, 0x2000, 0x10, "__main__:g").unwrap();

        let parent_text = fs::read_to_string(map.path_for(parent)).unwrap();
        let child_text = fs::read_to_string(map.path_for(child)).unwrap();
        assert_eq!(parent_text, "1000 10 __main__:f\n");
        assert_eq!(child_text, "1000 10 __main__:f\n2000 10 __main__:g\n");
        assert_eq!(map.path(), map.path_for(child));
    }
}
