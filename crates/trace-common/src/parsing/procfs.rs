//! Utility functions used to extract process metadata from procfs

use glob::glob;
use nix::sys::stat;
use nix::unistd::{Pid, Uid};
use std::{
    fs::{self, File},
    io::{self, prelude::*, BufReader},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },

    #[error("stat of {path} failed")]
    Stat {
        #[source]
        source: nix::errno::Errno,
        path: String,
    },

    #[error("parent for process {0} not found")]
    ParentNotFound(Pid),
    #[error("thread group for process {0} not found")]
    ThreadGroupNotFound(Pid),
    #[error("process {0} has an empty command line")]
    EmptyCommandLine(Pid),

    #[error("globbing running processes")]
    GlobbingError(#[from] glob::PatternError),
    #[error("unreadable entry")]
    GlobError(#[from] glob::GlobError),
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

/// Identity of a mount namespace: device and inode of its `ns/mnt` handle.
/// Two processes share a mount namespace iff their ids compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountNsId {
    pub dev: u64,
    pub ino: u64,
}

/// Returns the mount namespace id of a given process.
pub fn get_mount_ns(pid: Pid) -> Result<MountNsId, ProcfsError> {
    let path = format!("/proc/{pid}/ns/mnt");
    let st = stat::stat(path.as_str()).map_err(|source| ProcfsError::Stat { source, path })?;
    Ok(MountNsId {
        dev: st.st_dev as u64,
        ino: st.st_ino,
    })
}

/// Returns the command name (argv[0]) for the given process.
pub fn get_process_command_name(pid: Pid) -> Result<String, ProcfsError> {
    let path = format!("/proc/{pid}/cmdline");
    let data = fs::read(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;
    first_cmdline_token(&data).ok_or(ProcfsError::EmptyCommandLine(pid))
}

/// First NUL-separated token of a raw cmdline image.
fn first_cmdline_token(data: &[u8]) -> Option<String> {
    let token = data.split(|b| *b == 0).next()?;
    if token.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(token).into_owned())
}

/// Returns the parent of a given process.
pub fn get_process_parent_pid(pid: Pid) -> Result<Pid, ProcfsError> {
    let value = read_status_field(pid, "PPid:")?.ok_or(ProcfsError::ParentNotFound(pid))?;
    Ok(Pid::from_raw(value.parse()?))
}

/// Returns the user id owning a given process, read from its proc directory.
pub fn get_process_uid(pid: Pid) -> Result<Uid, ProcfsError> {
    let path = format!("/proc/{pid}");
    let st = stat::stat(path.as_str()).map_err(|source| ProcfsError::Stat { source, path })?;
    Ok(Uid::from_raw(st.st_uid))
}

/// Whether the given pid names a whole process rather than one of its
/// threads: true iff the thread group id equals the pid itself.
pub fn is_thread_group_leader(pid: Pid) -> Result<bool, ProcfsError> {
    let value = read_status_field(pid, "Tgid:")?.ok_or(ProcfsError::ThreadGroupNotFound(pid))?;
    let tgid: i32 = value.parse()?;
    Ok(tgid == pid.as_raw())
}

fn read_status_field(pid: Pid, key: &str) -> Result<Option<String>, ProcfsError> {
    let path = format!("/proc/{pid}/status");
    let file = File::open(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        if let Some(value) = parse_status_field(&line, key) {
            return Ok(Some(value));
        }
    }

    Ok(None)
}

fn parse_status_field(line: &str, key: &str) -> Option<String> {
    let rest = line.strip_prefix(key)?;
    rest.split_whitespace().next().map(str::to_owned)
}

pub fn get_running_processes() -> Result<Vec<Pid>, ProcfsError> {
    glob("/proc/[0-9]*")?
        .map(|entry| {
            let entry: String = entry?.to_string_lossy().into();
            let pid = entry.replace("/proc/", "").parse()?;
            Ok(Pid::from_raw(pid))
        })
        .collect()
}

/// Process metadata reads needed by the monitor, as a trait so the test
/// suite can substitute a scripted process table.
pub trait ProcessSource: Send + Sync + 'static {
    fn running_processes(&self) -> Result<Vec<Pid>, ProcfsError>;
    fn command_name(&self, pid: Pid) -> Result<String, ProcfsError>;
    fn parent_pid(&self, pid: Pid) -> Result<Pid, ProcfsError>;
    fn process_uid(&self, pid: Pid) -> Result<Uid, ProcfsError>;
    fn mount_ns(&self, pid: Pid) -> Result<MountNsId, ProcfsError>;
    fn is_thread_group_leader(&self, pid: Pid) -> Result<bool, ProcfsError>;
}

/// The real procfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Procfs;

impl ProcessSource for Procfs {
    fn running_processes(&self) -> Result<Vec<Pid>, ProcfsError> {
        get_running_processes()
    }

    fn command_name(&self, pid: Pid) -> Result<String, ProcfsError> {
        get_process_command_name(pid)
    }

    fn parent_pid(&self, pid: Pid) -> Result<Pid, ProcfsError> {
        get_process_parent_pid(pid)
    }

    fn process_uid(&self, pid: Pid) -> Result<Uid, ProcfsError> {
        get_process_uid(pid)
    }

    fn mount_ns(&self, pid: Pid) -> Result<MountNsId, ProcfsError> {
        get_mount_ns(pid)
    }

    fn is_thread_group_leader(&self, pid: Pid) -> Result<bool, ProcfsError> {
        is_thread_group_leader(pid)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_first_cmdline_token() {
        assert_eq!(
            first_cmdline_token(b"spawner64\0--start-system-server\0"),
            Some("spawner64".to_string())
        );
        assert_eq!(
            first_cmdline_token(b"<pre-initialized>\0"),
            Some("<pre-initialized>".to_string())
        );
        assert_eq!(first_cmdline_token(b"com.example.app"), Some("com.example.app".to_string()));
        assert_eq!(first_cmdline_token(b""), None);
        assert_eq!(first_cmdline_token(b"\0\0"), None);
    }

    #[test]
    fn test_parse_status_field() {
        assert_eq!(parse_status_field("PPid:\t1", "PPid:"), Some("1".to_string()));
        assert_eq!(parse_status_field("Tgid:\t4280", "Tgid:"), Some("4280".to_string()));
        assert_eq!(parse_status_field("Pid:\t4280", "PPid:"), None);
        assert_eq!(parse_status_field("", "PPid:"), None);
    }

    #[test]
    fn test_current_process_is_leader() {
        let me = Pid::from_raw(std::process::id() as i32);
        assert_eq!(is_thread_group_leader(me).unwrap(), true);
        assert!(get_process_command_name(me).is_ok());
        assert!(get_mount_ns(me).is_ok());
    }

    #[test]
    fn test_running_processes_contains_self() {
        let me = Pid::from_raw(std::process::id() as i32);
        assert!(get_running_processes().unwrap().contains(&me));
    }
}
