use crate::error::{ApiError, BridgeResult, ErrorCode};
use crate::session::shell::{LaunchPlan, Platform};
use portable_pty::{Child, CommandBuilder, MasterPty, PtyPair, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::path::PathBuf;

/// Live handles of a shell spawned on a fresh pseudo-terminal.
pub struct PtyHandles {
    pub master: Box<dyn MasterPty + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub pid: u32,
    pub shell: PathBuf,
}

pub fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn unavailable_hint(platform: Platform) -> &'static str {
    if platform.is_windows() {
        "ConPTY requires Windows 10 version 1809 or later"
    } else {
        "check that /dev/ptmx exists and devpts is mounted and accessible to this process"
    }
}

fn open_pty(cols: u16, rows: u16) -> BridgeResult<PtyPair> {
    native_pty_system()
        .openpty(pty_size(cols, rows))
        .map_err(|err| {
            let platform = Platform::current();
            ApiError::new(
                ErrorCode::PtyUnavailable,
                format!("Pseudo-terminal unavailable: {}", unavailable_hint(platform)),
            )
            .with_details(err.to_string())
            .into()
        })
}

fn build_command(plan: &LaunchPlan) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&plan.shell);
    cmd.args(&plan.args);
    cmd.cwd(&plan.cwd);
    cmd.env_clear();
    for (key, value) in &plan.env {
        cmd.env(key, value);
    }
    cmd
}

/// Allocates a pty and starts a shell on it.
///
/// `plan_for` receives the shells that already failed. When the first
/// spawn fails the plan is recomputed once without that shell; if that
/// yields the same shell, or fails as well, the error lists every attempt.
pub fn spawn_shell(
    cols: u16,
    rows: u16,
    plan_for: impl Fn(&[PathBuf]) -> LaunchPlan,
) -> BridgeResult<PtyHandles> {
    let pair = open_pty(cols, rows)?;

    let mut failures: Vec<(PathBuf, String)> = Vec::new();
    let mut child = None;
    for _attempt in 0..2 {
        let skip: Vec<PathBuf> = failures.iter().map(|(shell, _)| shell.clone()).collect();
        let plan = plan_for(&skip);
        if skip.contains(&plan.shell) {
            break;
        }
        tracing::info!(shell = %plan.shell.display(), cwd = %plan.cwd.display(), "Spawning pty shell");
        match pair.slave.spawn_command(build_command(&plan)) {
            Ok(spawned) => {
                child = Some((spawned, plan.shell));
                break;
            }
            Err(err) => {
                tracing::warn!(shell = %plan.shell.display(), error = %err, "Shell spawn failed");
                failures.push((plan.shell, err.to_string()));
            }
        }
    }

    let Some((child, shell)) = child else {
        return Err(spawn_error(&failures).into());
    };
    // The child keeps its own slave descriptor; ours would hold EOF back.
    drop(pair.slave);

    let pid = child.process_id().unwrap_or_default();
    let reader = pair.master.try_clone_reader().map_err(|err| {
        ApiError::new(ErrorCode::IoError, "Failed to clone pty reader").with_details(err.to_string())
    })?;
    let writer = pair.master.take_writer().map_err(|err| {
        ApiError::new(ErrorCode::IoError, "Failed to take pty writer").with_details(err.to_string())
    })?;

    Ok(PtyHandles {
        master: pair.master,
        child,
        reader,
        writer,
        pid,
        shell,
    })
}

fn spawn_error(failures: &[(PathBuf, String)]) -> ApiError {
    let attempts = failures
        .iter()
        .map(|(shell, err)| format!("{} ({})", shell.display(), err))
        .collect::<Vec<_>>()
        .join(", ");
    ApiError::new(ErrorCode::SpawnFailed, "Failed to spawn shell").with_details(format!(
        "platform={} arch={} attempted={}",
        Platform::current().name(),
        std::env::consts::ARCH,
        attempts
    ))
}
