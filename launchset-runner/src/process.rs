use launchset_core::{Interpreter, Invocation, LaunchsetError, ProcessDescriptor, Result};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// A descriptor whose working directory and executable were checked
#[derive(Debug, Clone)]
pub struct PreparedLaunch {
    pub name: String,
    pub program: PathBuf,
    pub invocation: Invocation,
}

impl PreparedLaunch {
    pub fn command_line(&self) -> String {
        self.invocation.command_line()
    }
}

/// Check everything that has to exist before a descriptor can be spawned
pub fn prepare(descriptor: &ProcessDescriptor) -> Result<PreparedLaunch> {
    let invocation = descriptor.invocation();

    if !invocation.cwd.is_dir() {
        return Err(LaunchsetError::InvalidConfiguration(format!(
            "Working directory '{}' of process '{}' does not exist",
            invocation.cwd.display(),
            descriptor.name
        )));
    }

    let path_override = invocation.env.get("PATH").map(String::as_str);
    let program = resolve_program(&invocation.program, &invocation.cwd, path_override)?;

    if let Interpreter::Program(_) = descriptor.interpreter {
        let script = invocation.cwd.join(&descriptor.script);
        if !script.is_file() {
            return Err(LaunchsetError::InvalidConfiguration(format!(
                "Script '{}' of process '{}' does not exist",
                script.display(),
                descriptor.name
            )));
        }
    }

    Ok(PreparedLaunch {
        name: descriptor.name.clone(),
        program,
        invocation,
    })
}

/// Paths are taken relative to `cwd`, bare names are looked up on PATH
pub fn resolve_program(program: &str, cwd: &Path, path_override: Option<&str>) -> Result<PathBuf> {
    if is_path_like(program) {
        let candidate = Path::new(program);
        let resolved = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            cwd.join(candidate)
        };
        return if resolved.is_file() {
            Ok(resolved)
        } else {
            Err(LaunchsetError::ExecutableNotFound(format!(
                "'{}' does not exist",
                resolved.display()
            )))
        };
    }

    let found = match path_override {
        Some(paths) => which::which_in(program, Some(paths), cwd),
        None => which::which(program),
    };

    found.map_err(|_| {
        LaunchsetError::ExecutableNotFound(format!("'{}' not found in PATH", program))
    })
}

fn is_path_like(program: &str) -> bool {
    program.contains('/') || (cfg!(windows) && program.contains('\\'))
}

/// Start the prepared command with the descriptor's environment merged in
pub fn spawn(prepared: &PreparedLaunch) -> Result<Child> {
    let invocation = &prepared.invocation;

    debug!(
        name = %prepared.name,
        program = %prepared.program.display(),
        cwd = %invocation.cwd.display(),
        "Spawning process"
    );

    Command::new(&prepared.program)
        .args(&invocation.args)
        .current_dir(&invocation.cwd)
        .envs(&invocation.env)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            LaunchsetError::ExecutionError(format!(
                "Failed to spawn '{}': {}",
                prepared.name, e
            ))
        })
}

/// Ask the child to exit, then kill it once `grace` has passed
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid = pid, error = %e, "Failed to send SIGTERM");
            } else if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return status.ok();
            }
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Failed to kill process");
    }
    child.wait().await.ok()
}
