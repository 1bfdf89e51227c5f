//! Leader addressing on disk.
//!
//! Each leader owns `<root>/<pid>/` and listens on `<root>/<pid>/config.sock`.
//! A named leader also publishes `<root>/by-name/<name>` as a symlink to its
//! pid directory. Clients resolve a target string through one or the other.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};


pub const SOCKET_NAME: &str = "config.sock";
const BY_NAME: &str = "by-name";


/// Check if a process with the given PID is alive.
pub fn is_pid_alive(pid: u32) -> bool {
    // kill(pid, 0) checks if the process exists without sending a signal.
    // EPERM means it exists but belongs to someone else.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}


#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RunDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    pub fn socket_path(&self, pid: u32) -> PathBuf {
        self.pid_dir(pid).join(SOCKET_NAME)
    }

    pub fn name_link(&self, name: &str) -> PathBuf {
        self.root.join(BY_NAME).join(name)
    }

    /// Claim the pid directory for `pid` and, if given, the name `name`.
    ///
    /// A name held by a live leader is refused; a name left behind by a
    /// dead one is taken over.
    pub fn register(&self, pid: u32, name: Option<&str>) -> Result<Registration> {
        let dir = self.pid_dir(pid);
        std::fs::create_dir_all(&dir)
            .map_err(|e| ConfigError::Io(format!("cannot create {}: {}", dir.display(), e)))?;

        let link = match name.map(|n| self.claim_name(n, &dir)).transpose() {
            Ok(link) => link,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(e);
            }
        };
        info!(dir = %dir.display(), name = ?name, "run directory registered");
        Ok(Registration {
            socket: dir.join(SOCKET_NAME),
            dir,
            link,
        })
    }

    fn claim_name(&self, name: &str, dir: &Path) -> Result<PathBuf> {
        validate_name(name)?;
        let link = self.name_link(name);
        if let Some(parent) = link.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        if let Ok(existing) = std::fs::read_link(&link) {
            match pid_of(&existing) {
                Some(pid) if is_pid_alive(pid) && existing != dir => {
                    return Err(ConfigError::invalid(
                        "register",
                        name,
                        format!("name already in use by process {}", pid),
                    ));
                }
                _ => {
                    debug!(name, stale = %existing.display(), "replacing stale name link");
                    let _ = std::fs::remove_file(&link);
                }
            }
        }
        std::os::unix::fs::symlink(dir, &link)
            .map_err(|e| ConfigError::Io(format!("cannot link {}: {}", link.display(), e)))?;
        Ok(link)
    }

    /// Resolve a target (a pid or a leader name) to its socket path.
    pub fn resolve(&self, target: &str) -> Result<PathBuf> {
        if let Ok(pid) = target.parse::<u32>() {
            if !is_pid_alive(pid) {
                return Err(ConfigError::Io(format!("no leader process {} is running", pid)));
            }
            let sock = self.socket_path(pid);
            if !sock.exists() {
                return Err(ConfigError::Io(format!(
                    "process {} has no control socket at {}",
                    pid,
                    sock.display()
                )));
            }
            return Ok(sock);
        }

        validate_name(target)?;
        let link = self.name_link(target);
        let dir = std::fs::read_link(&link)
            .map_err(|_| ConfigError::Io(format!("no leader named '{}'", target)))?;
        match pid_of(&dir) {
            Some(pid) if is_pid_alive(pid) => Ok(dir.join(SOCKET_NAME)),
            _ => Err(ConfigError::Io(format!("leader '{}' is no longer running", target))),
        }
    }

    /// Pids of every leader directory whose process is still alive.
    pub fn live_leaders(&self) -> Vec<u32> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut pids: Vec<u32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<u32>().ok()))
            .filter(|pid| is_pid_alive(*pid))
            .collect();
        pids.sort_unstable();
        pids
    }
}


fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(ConfigError::invalid("resolve", name, "not a valid leader name"));
    }
    Ok(())
}


fn pid_of(dir: &Path) -> Option<u32> {
    dir.file_name()?.to_str()?.parse().ok()
}


/// A leader's claim on the run directory. Dropping it removes the pid
/// directory and the name link.
#[derive(Debug)]
pub struct Registration {
    dir: PathBuf,
    socket: PathBuf,
    link: Option<PathBuf>,
}

impl Registration {
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(link) = &self.link {
            // Only remove the link if it still points at us.
            if std::fs::read_link(link).ok().as_deref() == Some(self.dir.as_path()) {
                let _ = std::fs::remove_file(link);
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "cannot remove run directory");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> u32 {
        std::process::id()
    }

    #[test]
    fn register_creates_dir_and_link() {
        let tmp = tempfile::tempdir().unwrap();
        let rd = RunDir::new(tmp.path());
        let reg = rd.register(me(), Some("lwaftr")).unwrap();
        assert!(reg.dir().is_dir());
        assert_eq!(reg.socket(), rd.socket_path(me()).as_path());
        assert_eq!(std::fs::read_link(rd.name_link("lwaftr")).unwrap(), rd.pid_dir(me()));
        drop(reg);
        assert!(!rd.pid_dir(me()).exists());
        assert!(std::fs::symlink_metadata(rd.name_link("lwaftr")).is_err());
    }

    #[test]
    fn resolve_by_pid_and_name() {
        let tmp = tempfile::tempdir().unwrap();
        let rd = RunDir::new(tmp.path());
        let reg = rd.register(me(), Some("a")).unwrap();
        std::fs::write(reg.socket(), b"").unwrap();
        assert_eq!(rd.resolve(&me().to_string()).unwrap(), rd.socket_path(me()));
        assert_eq!(rd.resolve("a").unwrap(), rd.pid_dir(me()).join(SOCKET_NAME));
        assert!(rd.resolve("b").is_err());
        assert_eq!(rd.live_leaders(), vec![me()]);
    }

    #[test]
    fn dead_pid_does_not_resolve() {
        let tmp = tempfile::tempdir().unwrap();
        let rd = RunDir::new(tmp.path());
        // pid_max on Linux is at most 2^22
        let dead = 4_194_304 + 17;
        std::fs::create_dir_all(rd.pid_dir(dead)).unwrap();
        let err = rd.resolve(&dead.to_string()).unwrap_err();
        assert!(err.to_string().contains("no leader process"));
        assert!(rd.live_leaders().is_empty());
    }

    #[test]
    fn stale_name_is_taken_over() {
        let tmp = tempfile::tempdir().unwrap();
        let rd = RunDir::new(tmp.path());
        std::fs::create_dir_all(tmp.path().join(BY_NAME)).unwrap();
        std::os::unix::fs::symlink(rd.pid_dir(4_194_400), rd.name_link("x")).unwrap();
        let _reg = rd.register(me(), Some("x")).unwrap();
        assert_eq!(std::fs::read_link(rd.name_link("x")).unwrap(), rd.pid_dir(me()));
    }

    #[test]
    fn live_name_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let rd = RunDir::new(tmp.path());
        std::fs::create_dir_all(tmp.path().join(BY_NAME)).unwrap();
        // pid 1 is always alive
        std::os::unix::fs::symlink(rd.pid_dir(1), rd.name_link("taken")).unwrap();
        let err = rd.register(me(), Some("taken")).unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[test]
    fn bad_names_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let rd = RunDir::new(tmp.path());
        assert!(rd.resolve("../etc").is_err());
        assert!(rd.register(me(), Some("")).is_err());
    }
}
