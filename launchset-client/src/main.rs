use clap::{Args, Parser, Subcommand};
use launchset_core::{avito_descriptor_set, DescriptorSet, InterpreterProfile, ProcessInfo};
use launchset_parser::load_descriptor_set;
use launchset_runner::Supervisor;
use reqwest::Client;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use tracing::debug;

#[derive(Parser)]
#[command(name = "launchset")]
#[command(about = "Launchset process launcher CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon URL
    #[arg(long, default_value = "http://127.0.0.1:9615")]
    server: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Check daemon health
    Health,

    /// Write an ecosystem.toml for the built-in process set
    Init {
        /// Interpreter profile: system, venv or relative
        #[arg(short, long, default_value = "system")]
        profile: String,

        /// Venv directory (venv profile) or interpreter path (relative profile)
        #[arg(long)]
        venv: Option<PathBuf>,

        /// Output path
        #[arg(short, long, default_value = "ecosystem.toml")]
        output: PathBuf,
    },

    /// Validate a descriptor set without starting anything
    Validate(SetArgs),

    /// Print the command each process would be launched with
    Show(SetArgs),

    /// Supervise a descriptor set in the foreground until Ctrl-C
    Run(SetArgs),

    /// List processes managed by the daemon
    List,

    /// Start a process on the daemon
    Start { name: String },

    /// Stop a process on the daemon
    Stop { name: String },

    /// Restart a process on the daemon
    Restart { name: String },
}

#[derive(Args)]
struct SetArgs {
    /// Ecosystem file (.toml or .json); the built-in set is used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interpreter profile for the built-in set: system, venv or relative
    #[arg(short, long, default_value = "system")]
    profile: String,

    /// Venv directory (venv profile) or interpreter path (relative profile)
    #[arg(long)]
    venv: Option<PathBuf>,

    /// Working directory of the built-in set
    #[arg(long)]
    root: Option<PathBuf>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::new();

    let outcome = match cli.command {
        Commands::Health => check_health(&client, &cli.server).await.map(|healthy| {
            if healthy {
                println!("Daemon is healthy");
            } else {
                eprintln!("Daemon is unhealthy");
                process::exit(1);
            }
        }),
        Commands::Init {
            profile,
            venv,
            output,
        } => generate_ecosystem_file(&profile, venv, &output),
        Commands::Validate(set_args) => resolve_set(&set_args).map(|set| {
            println!("✓ {} process(es) valid: {}", set.len(), set.names().join(", "));
        }),
        Commands::Show(set_args) => resolve_set(&set_args).map(|set| print!("{}", render_commands(&set))),
        Commands::Run(set_args) => run_foreground(&set_args).await,
        Commands::List => list_processes(&client, &cli.server)
            .await
            .map(|infos| print!("{}", render_table(&infos))),
        Commands::Start { name } => control(&client, &cli.server, &name, "start")
            .await
            .map(|info| print_info("Started", &info)),
        Commands::Stop { name } => control(&client, &cli.server, &name, "stop")
            .await
            .map(|info| print_info("Stopped", &info)),
        Commands::Restart { name } => control(&client, &cli.server, &name, "restart")
            .await
            .map(|info| print_info("Restarted", &info)),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    Ok(())
}

fn resolve_set(args: &SetArgs) -> anyhow::Result<DescriptorSet> {
    if let Some(config) = &args.config {
        return load_descriptor_set(config)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", config.display(), e));
    }

    let root = match &args.root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?,
    };
    let profile = InterpreterProfile::from_parts(&args.profile, args.venv.clone(), &root)?;
    Ok(avito_descriptor_set(&root, &profile)?)
}

fn render_commands(set: &DescriptorSet) -> String {
    let mut out = String::new();
    for descriptor in set {
        let invocation = descriptor.invocation();
        out.push_str(&format!("{}\n", descriptor.name));
        out.push_str(&format!("  cwd: {}\n", invocation.cwd.display()));
        out.push_str(&format!("  command: {}\n", invocation.command_line()));
        for (key, value) in &invocation.env {
            out.push_str(&format!("  env: {}={}\n", key, value));
        }
    }
    out
}

fn render_table(infos: &[ProcessInfo]) -> String {
    if infos.is_empty() {
        return "No processes managed.\n".to_string();
    }

    let mut out = format!(
        "{:<20} {:<10} {:>8} {:>9} {:<20}\n",
        "NAME", "STATUS", "PID", "RESTARTS", "STARTED"
    );
    for info in infos {
        let pid = info
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        let started = info
            .started_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<20} {:<10} {:>8} {:>9} {:<20}\n",
            info.name,
            info.status.label(),
            pid,
            info.restarts,
            started
        ));
    }
    out
}

fn print_info(action: &str, info: &ProcessInfo) {
    println!("✓ {} {} [{}]", action, info.name, info.status.label());
    if let Some(pid) = info.pid {
        println!("  PID: {}", pid);
    }
    println!("  Command: {}", info.command);
}

fn generate_ecosystem_file(profile: &str, venv: Option<PathBuf>, output: &Path) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!(
            "{} already exists; use a different path or remove the existing file",
            output.display()
        );
    }

    let profile = InterpreterProfile::from_parts(profile, venv, Path::new("."))?;
    let set = avito_descriptor_set(".", &profile)?;
    let body = toml::to_string(&set)?;

    let content = format!(
        "# Launchset ecosystem file\n# Relative cwd values resolve against this file's directory.\n\n{}",
        body
    );
    fs::write(output, content)?;
    println!("✓ Created ecosystem file at {}", output.display());
    Ok(())
}

async fn run_foreground(args: &SetArgs) -> anyhow::Result<()> {
    let set = resolve_set(args)?;
    let supervisor = Supervisor::new(set);

    println!("🚀 Starting {} process(es)...\n", supervisor.descriptors().len());
    print!("{}", render_table(&supervisor.start_all().await));
    println!("\nPress Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;

    println!("\nStopping...");
    print!("{}", render_table(&supervisor.stop_all().await));
    Ok(())
}

async fn check_health(client: &Client, server: &str) -> anyhow::Result<bool> {
    let url = format!("{}/health", server);
    let response = client.get(&url).send().await?;
    Ok(response.status().is_success())
}

async fn list_processes(client: &Client, server: &str) -> anyhow::Result<Vec<ProcessInfo>> {
    let url = format!("{}/api/v1/processes", server);
    let response = client.get(&url).send().await?;

    if response.status().is_success() {
        Ok(response.json().await?)
    } else {
        Err(anyhow::anyhow!(
            "Failed to list processes: {}",
            error_message(response).await
        ))
    }
}

async fn control(client: &Client, server: &str, name: &str, action: &str) -> anyhow::Result<ProcessInfo> {
    let url = format!("{}/api/v1/processes/{}/{}", server, name, action);
    debug!(url = %url, "Sending control request");
    let response = client.post(&url).send().await?;

    if response.status().is_success() {
        Ok(response.json().await?)
    } else if response.status() == reqwest::StatusCode::NOT_FOUND {
        Err(anyhow::anyhow!("Process not found: {}", name))
    } else {
        Err(anyhow::anyhow!(
            "Failed to {} {}: {}",
            action,
            name,
            error_message(response).await
        ))
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => body.error,
        Err(_) if text.is_empty() => status.to_string(),
        Err(_) => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use launchset_core::ProcessStatus;

    fn online(name: &str) -> ProcessInfo {
        ProcessInfo {
            name: name.to_string(),
            run_id: Some(uuid::Uuid::new_v4()),
            pid: Some(4242),
            status: ProcessStatus::Online,
            restarts: 1,
            started_at: Some(chrono::Utc::now()),
            last_exit_code: None,
            command: "python3 bot.py".to_string(),
        }
    }

    #[test]
    fn test_render_commands_for_builtin_set() {
        let set = avito_descriptor_set("/srv/avito", &InterpreterProfile::System).unwrap();
        let out = render_commands(&set);
        assert!(out.contains("command: python3 -m gunicorn config.wsgi:application --bind 0.0.0.0:8000"));
        assert!(out.contains("env: DJANGO_SETTINGS_MODULE=config.settings"));
        assert!(out.contains("command: python3 bot.py"));
    }

    #[test]
    fn test_venv_flag() {
        let cli = Cli::try_parse_from(["launchset", "init", "--profile", "venv", "--venv", "/srv/venv"]).unwrap();
        match cli.command {
            Commands::Init { profile, venv, .. } => {
                assert_eq!(profile, "venv");
                assert_eq!(venv, Some(PathBuf::from("/srv/venv")));
            }
            _ => panic!("expected init"),
        }

        let cli = Cli::try_parse_from(["launchset", "show", "-p", "relative", "--venv", "./env/bin/python"]).unwrap();
        let Commands::Show(args) = cli.command else {
            panic!("expected show");
        };
        let set = resolve_set(&args).unwrap();
        assert_eq!(
            set.get("avito-bot").unwrap().invocation().command_line(),
            "./env/bin/python bot.py"
        );

        assert!(Cli::try_parse_from(["launchset", "init", "--python", "/usr/bin/python3"]).is_err());
    }

    #[test]
    fn test_render_table() {
        let out = render_table(&[online("avito-bot")]);
        assert!(out.starts_with("NAME"));
        assert!(out.contains("avito-bot"));
        assert!(out.contains("ONLINE"));
        assert!(out.contains("4242"));
        assert_eq!(render_table(&[]), "No processes managed.\n");
    }

    #[test]
    fn test_generated_ecosystem_file_loads_back() {
        let dir = std::env::temp_dir().join(format!("launchset-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let output = dir.join("ecosystem.toml");

        generate_ecosystem_file("system", None, &output).unwrap();
        assert!(generate_ecosystem_file("system", None, &output).is_err());

        let set = load_descriptor_set(&output).unwrap();
        let root = fs::canonicalize(&dir).unwrap();
        assert_eq!(set.names(), vec!["avito-admin", "avito-bot"]);
        assert!(set.iter().all(|app| app.cwd == root));
        assert_eq!(
            set.get("avito-admin").unwrap().invocation().command_line(),
            "python3 -m gunicorn config.wsgi:application --bind 0.0.0.0:8000"
        );
        assert_eq!(
            set.get("avito-bot").unwrap().invocation().command_line(),
            "python3 bot.py"
        );

        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_list_processes() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::to_string(&vec![online("avito-admin"), online("avito-bot")]).unwrap();
        let mock = server
            .mock("GET", "/api/v1/processes")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let infos = list_processes(&Client::new(), &server.url()).await.unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[1].name, "avito-bot");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_control_reports_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v1/processes/ghost/restart")
            .with_status(404)
            .with_body(r#"{"error":"Process not found: ghost"}"#)
            .create_async()
            .await;

        let err = control(&Client::new(), &server.url(), "ghost", "restart")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Process not found: ghost");
    }

    #[tokio::test]
    async fn test_control_surfaces_daemon_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v1/processes/avito-bot/start")
            .with_status(500)
            .with_body(r#"{"error":"Executable not found: 'python3' not found in PATH"}"#)
            .create_async()
            .await;

        let err = control(&Client::new(), &server.url(), "avito-bot", "start")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found in PATH"));
    }

    #[tokio::test]
    async fn test_health() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body("OK")
            .create_async()
            .await;

        assert!(check_health(&Client::new(), &server.url()).await.unwrap());
    }
}
