//! Filesystem locations for persisted records, rev files, state, and the PID file.

use directories::ProjectDirs;
use thiserror::Error;

use std::path::PathBuf;
use std::{fs, io};

const DOMAIN: &str = "net";
const COMPANY: &str = "overlayd";
const PRODUCT: &str = "overlayd";

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to determine project directories")]
    NoProjectDirs,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

fn project() -> Option<ProjectDirs> {
    ProjectDirs::from(DOMAIN, COMPANY, PRODUCT)
}

/// Directory holding typed records (tunnels, physical interfaces, policy groups).
/// Defaults to `/etc/overlayd` when running as root, falls back to the
/// project config dir otherwise (convenient for tests and non-root dev runs).
pub fn records_dir() -> Result<PathBuf, Error> {
    if is_root() {
        let dir = PathBuf::from("/etc/overlayd");
        fs::create_dir_all(&dir)?;
        return Ok(dir);
    }
    let p_dirs = project().ok_or(Error::NoProjectDirs)?;
    let dir = p_dirs.config_dir().to_path_buf();
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Directory holding rev files, the daemon state file, and the PID file.
pub fn runtime_dir() -> Result<PathBuf, Error> {
    if is_root() {
        let dir = PathBuf::from("/var/lib/overlayd");
        fs::create_dir_all(&dir)?;
        return Ok(dir);
    }
    let p_dirs = project().ok_or(Error::NoProjectDirs)?;
    let dir = p_dirs.cache_dir().to_path_buf();
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(unix)]
fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_dir_creates_directory() {
        let dir = runtime_dir().expect("runtime dir resolves");
        assert!(dir.exists());
    }
}
