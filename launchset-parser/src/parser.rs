use crate::args::parse_args;
use launchset_core::{
    DescriptorSet, Interpreter, LaunchsetError, ProcessDescriptor, RestartPolicy, Result,
};
use serde::de::IgnoredAny;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// On-disk encoding of an ecosystem file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcosystemFormat {
    Toml,
    Json,
}

impl EcosystemFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(EcosystemFormat::Toml),
            Some("json") => Ok(EcosystemFormat::Json),
            _ => Err(LaunchsetError::InvalidConfiguration(format!(
                "Unsupported ecosystem file '{}': expected a .toml or .json file",
                path.display()
            ))),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEcosystem {
    apps: Vec<RawApp>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawApp {
    name: String,
    script: String,
    args: Option<RawArgs>,
    cwd: Option<PathBuf>,
    interpreter: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, RawEnvValue>,
    autorestart: Option<bool>,
    max_restarts: Option<u32>,
    min_uptime_ms: Option<u64>,
    restart_delay_ms: Option<u64>,
    kill_timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawArgs {
    Line(String),
    List(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEnvValue {
    Text(String),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Flag(bool),
    Nested(IgnoredAny),
}

/// Parse ecosystem file contents; relative working directories resolve against `base_dir`
pub fn parse_ecosystem(
    input: &str,
    format: EcosystemFormat,
    base_dir: &Path,
) -> Result<DescriptorSet> {
    let raw: RawEcosystem = match format {
        EcosystemFormat::Toml => toml::from_str(input)
            .map_err(|e| LaunchsetError::ParseError(format!("Invalid TOML: {}", e)))?,
        EcosystemFormat::Json => serde_json::from_str(input)
            .map_err(|e| LaunchsetError::ParseError(format!("Invalid JSON: {}", e)))?,
    };

    let apps = raw
        .apps
        .into_iter()
        .map(|app| build_descriptor(app, base_dir))
        .collect::<Result<Vec<_>>>()?;

    DescriptorSet::new(apps)
}

/// Read an ecosystem file, picking the format from its extension
pub fn load_descriptor_set<P: AsRef<Path>>(path: P) -> Result<DescriptorSet> {
    let path = path.as_ref();
    let format = EcosystemFormat::from_path(path)?;
    let content = fs::read_to_string(path)?;

    let absolute = fs::canonicalize(path)?;
    let base_dir = absolute
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));

    let set = parse_ecosystem(&content, format, &base_dir)?;
    debug!(
        path = %path.display(),
        apps = set.len(),
        "Loaded ecosystem file"
    );
    Ok(set)
}

fn build_descriptor(app: RawApp, base_dir: &Path) -> Result<ProcessDescriptor> {
    let args = match app.args {
        Some(RawArgs::Line(line)) => parse_args(&line)?,
        Some(RawArgs::List(list)) => list,
        None => Vec::new(),
    };

    let cwd = match app.cwd {
        Some(cwd) if cwd.is_absolute() => cwd,
        Some(cwd) => {
            let relative: PathBuf = cwd
                .components()
                .filter(|component| *component != Component::CurDir)
                .collect();
            if relative.as_os_str().is_empty() {
                base_dir.to_path_buf()
            } else {
                base_dir.join(relative)
            }
        }
        None => base_dir.to_path_buf(),
    };

    let interpreter = match app.interpreter {
        Some(interpreter) => Interpreter::from(interpreter),
        None => Interpreter::infer(&app.script),
    };

    let mut env = BTreeMap::new();
    for (key, value) in app.env {
        let value = match value {
            RawEnvValue::Text(text) => text,
            RawEnvValue::Integer(n) => n.to_string(),
            RawEnvValue::Unsigned(n) => n.to_string(),
            RawEnvValue::Float(n) => n.to_string(),
            RawEnvValue::Flag(flag) => flag.to_string(),
            RawEnvValue::Nested(_) => {
                return Err(LaunchsetError::InvalidConfiguration(format!(
                    "Environment variable '{}' of process '{}' must be a string, number or boolean",
                    key, app.name
                )));
            }
        };
        env.insert(key, value);
    }

    let defaults = RestartPolicy::default();
    let restart = RestartPolicy {
        autorestart: app.autorestart.unwrap_or(defaults.autorestart),
        max_restarts: app.max_restarts.unwrap_or(defaults.max_restarts),
        min_uptime_ms: app.min_uptime_ms.unwrap_or(defaults.min_uptime_ms),
        restart_delay_ms: app.restart_delay_ms.unwrap_or(defaults.restart_delay_ms),
        kill_timeout_ms: app.kill_timeout_ms.unwrap_or(defaults.kill_timeout_ms),
    };

    Ok(ProcessDescriptor {
        name: app.name,
        script: app.script,
        args,
        cwd,
        interpreter,
        restart,
        env,
    })
}
