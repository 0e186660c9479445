use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    time::Duration,
};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

const STALE_EXIT_POLLS: u32 = 20;
const STALE_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Linux reports the image of a process whose binary was unlinked (for example
/// by a re-extraction) as `<path> (deleted)`.
fn strip_deleted_suffix(exe: &Path) -> PathBuf {
    match exe.to_str().and_then(|s| s.strip_suffix(" (deleted)")) {
        Some(stripped) => PathBuf::from(stripped),
        None => exe.to_path_buf(),
    }
}

fn normalize(p: &Path) -> PathBuf {
    let p = std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    #[cfg(windows)]
    {
        if let Some(rest) = p.to_str().and_then(|s| s.strip_prefix(r"\\?\")) {
            return PathBuf::from(rest);
        }
    }
    p
}

fn paths_match(a: &Path, b: &Path) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    if cfg!(windows) {
        a.to_string_lossy().eq_ignore_ascii_case(&b.to_string_lossy())
    } else {
        a == b
    }
}

fn names_match(process_name: &OsStr, target_name: &OsStr) -> bool {
    if process_name == target_name {
        return true;
    }
    let (Some(p), Some(t)) = (process_name.to_str(), target_name.to_str()) else {
        return false;
    };
    if cfg!(windows) {
        return p.eq_ignore_ascii_case(t);
    }
    // Linux truncates the command name to 15 bytes.
    p.len() == 15 && t.starts_with(p)
}

/// Whether a process with this name and image is a leftover copy of `target`.
pub(crate) fn is_stale_instance(
    process_name: &OsStr,
    process_exe: Option<&Path>,
    target: &Path,
) -> bool {
    let Some(target_name) = target.file_name() else {
        return false;
    };
    if !names_match(process_name, target_name) {
        return false;
    }
    let Some(exe) = process_exe else {
        return false;
    };
    paths_match(&strip_deleted_suffix(exe), target)
}

/// Force-kills every other process running `executable`. The server locks its
/// own storage, so a leftover instance would make a fresh start fail.
///
/// Blocks for up to two seconds waiting for killed processes to disappear.
pub(crate) fn kill_stale_instances(executable: &Path) -> Vec<u32> {
    let refresh = ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet);
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh);

    let own = std::process::id();
    let mut killed = Vec::<Pid>::new();
    for (pid, process) in sys.processes() {
        if pid.as_u32() == own {
            continue;
        }
        if !is_stale_instance(process.name(), process.exe(), executable) {
            continue;
        }
        if process.kill() {
            tracing::warn!(pid = pid.as_u32(), exe = %executable.display(), "killed stale server instance");
            killed.push(*pid);
        } else {
            tracing::warn!(pid = pid.as_u32(), exe = %executable.display(), "failed to kill stale server instance");
        }
    }

    for _ in 0..STALE_EXIT_POLLS {
        if killed.is_empty() {
            break;
        }
        std::thread::sleep(STALE_EXIT_POLL_INTERVAL);
        sys.refresh_processes_specifics(ProcessesToUpdate::Some(&killed), true, refresh);
        killed.retain(|pid| sys.process(*pid).is_some());
    }
    if !killed.is_empty() {
        tracing::warn!(remaining = killed.len(), "stale server instances still present");
    }

    killed.into_iter().map(|p| p.as_u32()).collect()
}

#[cfg(target_os = "linux")]
pub(crate) unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Server goes down with us instead of lingering as a stale instance.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// `ETXTBSY`: the executable is still open for writing somewhere, typically
/// right after it was unpacked. Worth a short retry.
pub(crate) fn is_text_file_busy(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ETXTBSY)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}
