//! PID files for supervised processes.
//!
//! Each managed process gets `<run_dir>/<name>.pid` holding a single decimal
//! PID. The files only help a later `tn` invocation find processes started
//! by an earlier one; the supervisor's in-memory map is authoritative within
//! a run.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// PID file for process `name` inside `run_dir`.
    pub fn new(run_dir: &Path, name: &str) -> Self {
        Self {
            path: run_dir.join(format!("{}.pid", name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the PID, creating the run directory if needed.
    pub fn write(&self, pid: u32) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(&self.path)?;
        file.write_all(format!("{}\n", pid).as_bytes())?;
        file.sync_all()?;

        Ok(())
    }

    /// Read the recorded PID.
    ///
    /// `Ok(None)` if there is no file; `InvalidData` if the contents are not
    /// a positive decimal PID.
    pub fn read(&self) -> io::Result<Option<u32>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Self::parse_contents(&contents).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete the file. Missing files are fine.
    pub fn delete(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn parse_contents(contents: &str) -> io::Result<u32> {
        let invalid = || {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid PID file contents: {:?}", contents.trim()),
            )
        };

        match contents.trim().parse::<u32>() {
            Ok(0) | Err(_) => Err(invalid()),
            Ok(pid) => Ok(pid),
        }
    }
}
