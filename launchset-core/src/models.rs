use crate::error::{LaunchsetError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sentinel meaning the script is executed directly
pub const INTERPRETER_NONE: &str = "none";

/// Runtime used to execute a descriptor's script
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum Interpreter {
    /// The script is itself directly executable
    #[default]
    None,
    /// Path or logical name of the runtime, e.g. `python3` or `venv/bin/python`
    Program(String),
}

impl Interpreter {
    pub fn program<S: Into<String>>(program: S) -> Self {
        Interpreter::from(program.into())
    }

    /// Pick an interpreter from the script's file extension
    pub fn infer(script: &str) -> Self {
        let extension = Path::new(script)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();

        match extension {
            "py" => Interpreter::program("python3"),
            "sh" => Interpreter::program("bash"),
            "js" | "cjs" | "mjs" => Interpreter::program("node"),
            "rb" => Interpreter::program("ruby"),
            "php" => Interpreter::program("php"),
            _ => Interpreter::None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Interpreter::None)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Interpreter::None => INTERPRETER_NONE,
            Interpreter::Program(program) => program,
        }
    }
}

impl From<String> for Interpreter {
    fn from(s: String) -> Self {
        if s.is_empty() || s == INTERPRETER_NONE {
            Interpreter::None
        } else {
            Interpreter::Program(s)
        }
    }
}

impl From<&str> for Interpreter {
    fn from(s: &str) -> Self {
        Interpreter::from(s.to_string())
    }
}

impl From<Interpreter> for String {
    fn from(interpreter: Interpreter) -> Self {
        interpreter.as_str().to_string()
    }
}

impl std::fmt::Display for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the supervisor treats a process that exits on its own
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RestartPolicy {
    pub autorestart: bool,
    /// Consecutive unstable restarts allowed before giving up
    pub max_restarts: u32,
    /// A run at least this long counts as stable
    pub min_uptime_ms: u64,
    pub restart_delay_ms: u64,
    /// Grace period between the polite stop signal and a kill
    pub kill_timeout_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            autorestart: true,
            max_restarts: 16,
            min_uptime_ms: 1000,
            restart_delay_ms: 0,
            kill_timeout_ms: 1600,
        }
    }
}

impl RestartPolicy {
    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

/// Declarative record describing how to launch one managed process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessDescriptor {
    pub name: String,
    pub script: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub interpreter: Interpreter,
    #[serde(flatten)]
    pub restart: RestartPolicy,
    pub env: BTreeMap<String, String>,
}

impl ProcessDescriptor {
    pub fn new<N: Into<String>, S: Into<String>>(name: N, script: S) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            args: Vec::new(),
            cwd: PathBuf::from("."),
            interpreter: Interpreter::None,
            restart: RestartPolicy::default(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_interpreter<I: Into<Interpreter>>(mut self, interpreter: I) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd<P: AsRef<Path>>(mut self, cwd: P) -> Self {
        self.cwd = cwd.as_ref().to_path_buf();
        self
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Derive the concrete command the supervisor runs
    pub fn invocation(&self) -> Invocation {
        let (program, args) = match &self.interpreter {
            Interpreter::None => (self.script.clone(), self.args.clone()),
            Interpreter::Program(interpreter) => {
                let mut args = Vec::with_capacity(self.args.len() + 1);
                args.push(self.script.clone());
                args.extend(self.args.iter().cloned());
                (interpreter.clone(), args)
            }
        };

        Invocation {
            program,
            args,
            cwd: self.cwd.clone(),
            env: self.env.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LaunchsetError::InvalidConfiguration(
                "process name must not be empty".to_string(),
            ));
        }
        if self.script.trim().is_empty() {
            return Err(LaunchsetError::InvalidConfiguration(format!(
                "process '{}' has an empty script",
                self.name
            )));
        }
        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(LaunchsetError::InvalidConfiguration(format!(
                    "process '{}' has an invalid environment variable name '{}'",
                    self.name, key
                )));
            }
            if value.contains('\0') {
                return Err(LaunchsetError::InvalidConfiguration(format!(
                    "process '{}' has a NUL byte in environment variable '{}'",
                    self.name, key
                )));
            }
        }
        Ok(())
    }
}

/// Fully resolved invocation of a descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    /// Render `program args...` the way a shell user would type it
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote_arg)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_arg(arg: &str) -> Cow<'_, str> {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '\\');

    if !needs_quotes {
        return Cow::Borrowed(arg);
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    Cow::Owned(quoted)
}

/// Static, ordered collection of process descriptors
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DescriptorSet {
    apps: Vec<ProcessDescriptor>,
}

impl DescriptorSet {
    pub fn new(apps: Vec<ProcessDescriptor>) -> Result<Self> {
        let set = Self { apps };
        set.validate()?;
        Ok(set)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for app in &self.apps {
            app.validate()?;
            if !seen.insert(app.name.as_str()) {
                return Err(LaunchsetError::DuplicateName(app.name.clone()));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ProcessDescriptor> {
        self.apps.iter().find(|app| app.name == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProcessDescriptor> {
        self.apps.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.apps.iter().map(|app| app.name.as_str()).collect()
    }

    pub fn apps(&self) -> &[ProcessDescriptor] {
        &self.apps
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

impl<'a> IntoIterator for &'a DescriptorSet {
    type Item = &'a ProcessDescriptor;
    type IntoIter = std::slice::Iter<'a, ProcessDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
