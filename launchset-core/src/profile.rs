use crate::error::{LaunchsetError, Result};
use crate::models::{DescriptorSet, Interpreter, ProcessDescriptor};
use std::path::{Path, PathBuf};

/// Where the Python executable for the built-in set comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpreterProfile {
    /// `python3` from PATH
    System,
    /// A virtual environment directory
    Venv(PathBuf),
    /// An executable path relative to the working directory
    Relative(PathBuf),
}

impl InterpreterProfile {
    /// Build a profile from its CLI name; `path` overrides the default location
    pub fn from_parts(kind: &str, path: Option<PathBuf>, root: &Path) -> Result<Self> {
        match kind {
            "system" => Ok(InterpreterProfile::System),
            "venv" => Ok(InterpreterProfile::Venv(
                path.unwrap_or_else(|| root.join("venv")),
            )),
            "relative" => Ok(InterpreterProfile::Relative(
                path.unwrap_or_else(|| venv_python(Path::new("venv"))),
            )),
            other => Err(LaunchsetError::InvalidConfiguration(format!(
                "unknown interpreter profile '{}' (expected system, venv or relative)",
                other
            ))),
        }
    }

    pub fn executable(&self) -> String {
        match self {
            InterpreterProfile::System => "python3".to_string(),
            InterpreterProfile::Venv(dir) => venv_python(dir).to_string_lossy().into_owned(),
            InterpreterProfile::Relative(path) => path.to_string_lossy().into_owned(),
        }
    }
}

fn venv_python(dir: &Path) -> PathBuf {
    if cfg!(windows) {
        dir.join("Scripts").join("python.exe")
    } else {
        dir.join("bin").join("python")
    }
}

/// The admin web app behind gunicorn and the Telegram bot, both run from `root`
pub fn avito_descriptor_set<P: AsRef<Path>>(
    root: P,
    profile: &InterpreterProfile,
) -> Result<DescriptorSet> {
    let root = root.as_ref();
    let python = profile.executable();

    let admin = ProcessDescriptor::new("avito-admin", python.clone())
        .with_interpreter(Interpreter::None)
        .with_args([
            "-m",
            "gunicorn",
            "config.wsgi:application",
            "--bind",
            "0.0.0.0:8000",
        ])
        .with_cwd(root)
        .with_env("DJANGO_SETTINGS_MODULE", "config.settings");

    let bot = ProcessDescriptor::new("avito-bot", "bot.py")
        .with_interpreter(Interpreter::Program(python))
        .with_cwd(root);

    DescriptorSet::new(vec![admin, bot])
}
