//! Process enumeration/termination and launching.
//!
//! `kill` mirrors the legacy `psutil`-based matcher: any live process whose
//! argv contains `matcher` as a substring of any argument is signaled.
//! `launch` mirrors the legacy `find_and_start_app`: a custom `startCommand`
//! wins verbatim, otherwise a `python`/`conda run` interpreter invocation is
//! built from the binding.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agent_core::{AgentError, DeviceBinding};
use sysinfo::{Pid, System};
use tokio::time::sleep;
use tracing::{info, warn};

const TERMINATE_WAIT: Duration = Duration::from_secs(5);

/// Terminate every running process whose command line contains `matcher` as
/// a substring of any argument. Returns whether anything matched.
pub async fn kill(matcher: &str) -> Result<bool, AgentError> {
    let mut system = System::new_all();
    system.refresh_all();

    let mut matched: Vec<Pid> = Vec::new();
    for (pid, process) in system.processes() {
        let hits = process
            .cmd()
            .iter()
            .any(|arg| arg.to_string_lossy().contains(matcher));
        if hits {
            if let Some(p) = system.process(*pid) {
                p.kill_with(sysinfo::Signal::Term);
            }
            matched.push(*pid);
        }
    }

    if matched.is_empty() {
        return Ok(false);
    }

    info!(count = matched.len(), matcher, "sent terminate signal");

    let deadline = tokio::time::Instant::now() + TERMINATE_WAIT;
    loop {
        system.refresh_all();
        let alive: Vec<Pid> = matched
            .iter()
            .copied()
            .filter(|pid| system.process(*pid).is_some())
            .collect();
        if alive.is_empty() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            system.refresh_all();
            for pid in &alive {
                if let Some(p) = system.process(*pid) {
                    p.kill();
                }
            }
            warn!(count = alive.len(), "force-killed surviving processes");
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }

    Ok(true)
}

/// Resolve a `conda` executable the way the legacy agent does: `CONDA_EXE`
/// env var, then `PATH`, then a short list of common install locations.
pub fn resolve_conda_executable() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CONDA_EXE") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    if let Ok(path) = which_conda() {
        return Some(path);
    }

    let home = dirs_home()?;
    for candidate in [
        "anaconda3/condabin/conda",
        "anaconda3/bin/conda",
        "miniconda3/condabin/conda",
        "miniconda3/bin/conda",
    ] {
        let path = home.join(candidate);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

fn which_conda() -> Result<PathBuf, ()> {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let candidate = dir.join("conda");
                candidate.exists().then_some(candidate)
            })
        })
        .ok_or(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Launch the process described by `binding` with `working_dir` as its cwd
/// (ignored when a custom `startCommand` is set — the legacy agent spawns
/// that verbatim without a cwd override). Detached into its own session;
/// stdout/stderr discarded.
pub async fn launch(working_dir: &Path, binding: &DeviceBinding) -> Result<(), AgentError> {
    if let Some(start_command) = &binding.start_command {
        let mut tokens = start_command.split_whitespace();
        let Some(program) = tokens.next() else {
            return Err(AgentError::EntryNotFound);
        };
        spawn_detached(program, tokens.collect(), None).await?;
        info!(command = %start_command, "launched process via custom start command");
        return Ok(());
    }

    let entry_file = working_dir.join(&binding.entry_name);
    if !entry_file.exists() {
        return Err(AgentError::EntryNotFound);
    }

    let entry_arg = entry_file.to_string_lossy().to_string();
    if let Some(conda_env) = &binding.conda_env {
        let conda = resolve_conda_executable().ok_or_else(|| {
            AgentError::SupervisorFailure("conda environment not found".to_string())
        })?;
        spawn_detached(
            conda.to_string_lossy().as_ref(),
            vec!["run", "-n", conda_env, "python", &entry_arg],
            Some(working_dir),
        )
        .await?;
    } else {
        spawn_detached("python", vec![&entry_arg], Some(working_dir)).await?;
    }

    info!(entry = %entry_file.display(), "launched process");
    Ok(())
}

async fn spawn_detached(
    program: &str,
    args: Vec<&str>,
    working_dir: Option<&Path>,
) -> Result<(), AgentError> {
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            command.pre_exec(|| {
                nix_setsid();
                Ok(())
            });
        }
    }
    command.spawn()?;
    Ok(())
}

#[cfg(unix)]
fn nix_setsid() {
    // SAFETY: setsid() is always safe to call from a freshly-forked child
    // before exec; it detaches the child from the agent's session so the
    // agent's exit does not signal it.
    unsafe {
        libc::setsid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kill_with_no_matches_returns_false() {
        let matched = kill("definitely-not-a-real-process-name-xyz").await.unwrap();
        assert!(!matched);
    }

    #[tokio::test]
    async fn launch_fails_with_entry_not_found_for_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let binding = DeviceBinding {
            key: "D1".into(),
            is_custom: false,
            directory: dir.path().to_string_lossy().to_string(),
            entry_name: "missing.py".into(),
            conda_env: None,
            start_command: None,
            up_topic: "/devices/D1/sys/messages/up".into(),
        };
        let err = launch(dir.path(), &binding).await.unwrap_err();
        assert!(matches!(err, AgentError::EntryNotFound));
    }
}
