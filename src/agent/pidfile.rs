//! PID file locking so two agent processes never share a `data_dir` (spec
//! §8). Uses a plain create-exclusive-and-check-staleness scheme, the way
//! the teacher's own data-dir guard in `main.rs` validates the install
//! directory before the server starts.

use crate::error::{AgentError, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Acquire the PID file at `path`, failing if it already exists and
    /// names a process that is still alive.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Ok(existing) = fs::read_to_string(path) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if process_is_alive(pid) {
                    return Err(AgentError::Fatal(format!(
                        "data_dir already locked by running agent (pid {pid})"
                    )));
                }
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, std::process::id().to_string())?;
        Ok(Self { path: path.to_path_buf() })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // Sending signal 0 checks for existence/permission without actually
    // signaling the process.
    unsafe { libc_kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
extern "C" {
    #[link_name = "kill"]
    fn libc_kill(pid: i32, sig: i32) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_writes_current_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        let _pid_file = PidFile::acquire(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, std::process::id().to_string());
    }

    #[test]
    fn drop_removes_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        {
            let _pid_file = PidFile::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
