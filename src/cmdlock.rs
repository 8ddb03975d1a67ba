use std::fs::{File, OpenOptions};
use std::io::IsTerminal;

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;

use crate::config::APP_NAME;

/// Exclusive per-command lock so overlapping cron invocations of the same
/// command on the same host cannot run concurrently. The lock is released
/// when the guard (and its file handle) drops.
pub struct CmdLock {
    _file: File,
}

#[derive(Debug, thiserror::Error)]
#[error("another '{0}' invocation already holds the lock")]
pub struct Contended(pub String);

pub fn acquire(command: &str) -> Result<CmdLock> {
    let path = std::env::temp_dir().join(format!("{}-cron-{}.lock", APP_NAME, command));
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("opening lock file {}", path.display()))?;
    file.try_lock_exclusive()
        .map_err(|_| anyhow!(Contended(command.to_owned())))?;
    Ok(CmdLock { _file: file })
}

/// Lock contention in a pipeline/cron context is routine and should exit
/// without noise; an interactive user gets told what happened.
pub fn is_interactive() -> bool {
    std::io::stderr().is_terminal()
}
