use crate::process::{prepare, spawn, terminate};
use chrono::Utc;
use launchset_core::{
    DescriptorSet, LaunchsetError, ProcessDescriptor, ProcessInfo, ProcessStatus, Result,
};
use launchset_parser::load_descriptor_set;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Child;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

struct Slot {
    info: ProcessInfo,
    stop_tx: Option<watch::Sender<bool>>,
    /// Closed once the monitor task has reaped its child and returned
    done_rx: Option<watch::Receiver<()>>,
}

type Table = Arc<RwLock<HashMap<String, Slot>>>;

/// Starts, stops and restarts the processes of a descriptor set
#[derive(Clone)]
pub struct Supervisor {
    set: Arc<DescriptorSet>,
    table: Table,
}

impl Supervisor {
    pub fn new(set: DescriptorSet) -> Self {
        let table = set
            .iter()
            .map(|descriptor| {
                let info =
                    ProcessInfo::stopped(&descriptor.name, descriptor.invocation().command_line());
                (
                    descriptor.name.clone(),
                    Slot {
                        info,
                        stop_tx: None,
                        done_rx: None,
                    },
                )
            })
            .collect();

        Self {
            set: Arc::new(set),
            table: Arc::new(RwLock::new(table)),
        }
    }

    /// Load an ecosystem file and supervise its processes
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(load_descriptor_set(path)?))
    }

    pub fn descriptors(&self) -> &DescriptorSet {
        &self.set
    }

    /// Start every process; failures are logged and leave that process errored
    pub async fn start_all(&self) -> Vec<ProcessInfo> {
        for descriptor in self.set.iter() {
            if let Err(e) = self.start(&descriptor.name).await {
                error!(name = %descriptor.name, error = %e, "Failed to start process");
            }
        }
        self.list().await
    }

    pub async fn start(&self, name: &str) -> Result<ProcessInfo> {
        self.launch(name, false).await
    }

    pub async fn stop(&self, name: &str) -> Result<ProcessInfo> {
        let done_rx = {
            let mut table = self.table.write().await;
            let slot = table
                .get_mut(name)
                .ok_or_else(|| LaunchsetError::ProcessNotFound(name.to_string()))?;

            if !slot.info.status.is_running() {
                return Ok(slot.info.clone());
            }

            if slot.info.status != ProcessStatus::Stopping {
                info!(name = %name, "Stopping process");
                slot.info.status = ProcessStatus::Stopping;
            }
            if let Some(stop_tx) = &slot.stop_tx {
                // The monitor may already be gone if the child exited meanwhile.
                let _ = stop_tx.send(true);
            }
            slot.done_rx.clone()
        };

        // A second stop lands here too and waits for the same monitor.
        if let Some(mut done_rx) = done_rx {
            while done_rx.changed().await.is_ok() {}
        }

        let mut table = self.table.write().await;
        let slot = table
            .get_mut(name)
            .ok_or_else(|| LaunchsetError::ProcessNotFound(name.to_string()))?;
        if slot.info.status == ProcessStatus::Stopping {
            slot.info.status = ProcessStatus::Stopped;
            slot.info.pid = None;
        }
        Ok(slot.info.clone())
    }

    pub async fn restart(&self, name: &str) -> Result<ProcessInfo> {
        self.stop(name).await?;
        self.launch(name, true).await
    }

    pub async fn stop_all(&self) -> Vec<ProcessInfo> {
        for descriptor in self.set.iter() {
            if let Err(e) = self.stop(&descriptor.name).await {
                error!(name = %descriptor.name, error = %e, "Failed to stop process");
            }
        }
        self.list().await
    }

    /// Snapshots in descriptor order
    pub async fn list(&self) -> Vec<ProcessInfo> {
        let table = self.table.read().await;
        self.set
            .iter()
            .filter_map(|descriptor| table.get(&descriptor.name))
            .map(|slot| slot.info.clone())
            .collect()
    }

    pub async fn info(&self, name: &str) -> Result<ProcessInfo> {
        let table = self.table.read().await;
        table
            .get(name)
            .map(|slot| slot.info.clone())
            .ok_or_else(|| LaunchsetError::ProcessNotFound(name.to_string()))
    }

    async fn launch(&self, name: &str, count_as_restart: bool) -> Result<ProcessInfo> {
        let descriptor = self
            .set
            .get(name)
            .cloned()
            .ok_or_else(|| LaunchsetError::ProcessNotFound(name.to_string()))?;

        let mut table = self.table.write().await;
        let slot = table
            .get_mut(name)
            .ok_or_else(|| LaunchsetError::ProcessNotFound(name.to_string()))?;

        if slot.info.status.is_running() {
            return Ok(slot.info.clone());
        }

        slot.info.status = ProcessStatus::Launching;
        let child = match prepare(&descriptor).and_then(|prepared| spawn(&prepared)) {
            Ok(child) => child,
            Err(e) => {
                slot.info.status = ProcessStatus::Errored;
                slot.info.pid = None;
                return Err(e);
            }
        };

        let run_id = mark_online(&mut slot.info, &child);
        if count_as_restart {
            slot.info.restarts += 1;
        }

        info!(
            name = %name,
            pid = ?slot.info.pid,
            command = %slot.info.command,
            "Process online"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(());
        slot.stop_tx = Some(stop_tx);
        slot.done_rx = Some(done_rx);
        tokio::spawn(monitor(
            descriptor,
            Run { id: run_id, child },
            stop_rx,
            done_tx,
            Arc::clone(&self.table),
        ));

        Ok(slot.info.clone())
    }
}

fn mark_online(info: &mut ProcessInfo, child: &Child) -> Uuid {
    let run_id = Uuid::new_v4();
    info.status = ProcessStatus::Online;
    info.pid = child.id();
    info.run_id = Some(run_id);
    info.started_at = Some(Utc::now());
    run_id
}

/// The child a monitor currently owns
struct Run {
    id: Uuid,
    child: Child,
}

/// Apply `f` only while the table still describes `run_id`
async fn update<F>(table: &Table, name: &str, run_id: Uuid, f: F)
where
    F: FnOnce(&mut ProcessInfo),
{
    if let Some(slot) = table.write().await.get_mut(name) {
        if slot.info.run_id == Some(run_id) {
            f(&mut slot.info);
        }
    }
}

enum Wake {
    Exited(Option<i32>),
    StopRequested,
}

/// Watches one process until it is stopped or gives up restarting.
/// Dropping `_done_tx` on return tells waiting stops the child is gone.
async fn monitor(
    descriptor: ProcessDescriptor,
    mut run: Run,
    mut stop_rx: watch::Receiver<bool>,
    _done_tx: watch::Sender<()>,
    table: Table,
) {
    let name = descriptor.name.as_str();
    let policy = &descriptor.restart;
    let mut unstable_restarts: u32 = 0;
    let mut started = Instant::now();

    loop {
        let wake = tokio::select! {
            status = run.child.wait() => Wake::Exited(status.ok().and_then(|s| s.code())),
            _ = stop_rx.changed() => Wake::StopRequested,
        };

        let exit_code = match wake {
            Wake::StopRequested => {
                let status = terminate(&mut run.child, policy.kill_timeout()).await;
                let code = status.and_then(|s| s.code());
                info!(name = %name, exit_code = ?code, "Process stopped");
                update(&table, name, run.id, |info| {
                    info.status = ProcessStatus::Stopped;
                    info.pid = None;
                    info.last_exit_code = code;
                })
                .await;
                return;
            }
            Wake::Exited(code) => code,
        };

        warn!(
            name = %name,
            exit_code = ?exit_code,
            uptime_ms = started.elapsed().as_millis() as u64,
            "Process exited"
        );

        if !policy.autorestart {
            update(&table, name, run.id, |info| {
                info.status = ProcessStatus::Stopped;
                info.pid = None;
                info.last_exit_code = exit_code;
            })
            .await;
            return;
        }

        if started.elapsed() >= policy.min_uptime() {
            unstable_restarts = 0;
        } else {
            unstable_restarts += 1;
        }

        if unstable_restarts > policy.max_restarts {
            error!(
                name = %name,
                max_restarts = policy.max_restarts,
                "Process keeps crashing, giving up"
            );
            update(&table, name, run.id, |info| {
                info.status = ProcessStatus::Errored;
                info.pid = None;
                info.last_exit_code = exit_code;
            })
            .await;
            return;
        }

        update(&table, name, run.id, |info| {
            // A pending stop wins over the restart.
            if info.status != ProcessStatus::Stopping {
                info.status = ProcessStatus::Launching;
            }
            info.pid = None;
            info.last_exit_code = exit_code;
        })
        .await;

        if !policy.restart_delay().is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(policy.restart_delay()) => {}
                _ = stop_rx.changed() => {
                    update(&table, name, run.id, |info| info.status = ProcessStatus::Stopped).await;
                    return;
                }
            }
        }

        // Hold the table while respawning so a concurrent stop sees the new pid.
        let mut guard = table.write().await;
        let Some(slot) = guard.get_mut(name) else {
            return;
        };
        if slot.info.run_id != Some(run.id) || slot.info.status != ProcessStatus::Launching {
            return;
        }

        match prepare(&descriptor).and_then(|prepared| spawn(&prepared)) {
            Ok(child) => {
                started = Instant::now();
                let id = mark_online(&mut slot.info, &child);
                run = Run { id, child };
                slot.info.restarts += 1;
                info!(
                    name = %name,
                    pid = ?slot.info.pid,
                    restarts = slot.info.restarts,
                    "Process restarted"
                );
            }
            Err(e) => {
                error!(name = %name, error = %e, "Failed to restart process");
                slot.info.status = ProcessStatus::Errored;
                return;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use launchset_core::RestartPolicy;
    use std::time::Duration;

    fn shell(name: &str, script: &str) -> ProcessDescriptor {
        ProcessDescriptor::new(name, "sh")
            .with_args(["-c", script])
            .with_cwd(std::env::temp_dir())
    }

    fn policy(autorestart: bool, max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            autorestart,
            max_restarts,
            min_uptime_ms: 60_000,
            restart_delay_ms: 0,
            kill_timeout_ms: 2_000,
        }
    }

    async fn wait_until<F>(supervisor: &Supervisor, name: &str, done: F) -> ProcessInfo
    where
        F: Fn(&ProcessInfo) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let info = supervisor.info(name).await.unwrap();
            if done(&info) {
                return info;
            }
            assert!(Instant::now() < deadline, "timed out, last seen {:?}", info);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for_status(supervisor: &Supervisor, name: &str, status: ProcessStatus) -> ProcessInfo {
        wait_until(supervisor, name, |info| info.status == status).await
    }

    /// A shell loop that ignores SIGTERM and touches `marker` once the trap is set
    fn stubborn(name: &str, marker: &Path) -> ProcessDescriptor {
        let script = format!(
            "trap '' TERM; touch '{}'; while true; do sleep 0.1; done",
            marker.display()
        );
        shell(name, &script).with_restart(RestartPolicy {
            kill_timeout_ms: 1_500,
            ..policy(true, 16)
        })
    }

    async fn wait_for_file(path: &Path) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !path.exists() {
            assert!(Instant::now() < deadline, "{} never appeared", path.display());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn is_alive(pid: u32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let set = DescriptorSet::new(vec![shell("sleeper", "sleep 30")]).unwrap();
        let supervisor = Supervisor::new(set);

        let info = supervisor.start("sleeper").await.unwrap();
        assert_eq!(info.status, ProcessStatus::Online);
        assert!(info.pid.is_some());
        assert!(info.run_id.is_some());

        let again = supervisor.start("sleeper").await.unwrap();
        assert_eq!(again.pid, info.pid);

        let stopped = supervisor.stop("sleeper").await.unwrap();
        assert_eq!(stopped.status, ProcessStatus::Stopped);
        assert!(stopped.pid.is_none());
    }

    #[tokio::test]
    async fn test_restart_spawns_new_run() {
        let set = DescriptorSet::new(vec![shell("sleeper", "sleep 30")]).unwrap();
        let supervisor = Supervisor::new(set);

        let first = supervisor.start("sleeper").await.unwrap();
        let second = supervisor.restart("sleeper").await.unwrap();

        assert_eq!(second.status, ProcessStatus::Online);
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(second.restarts, 1);
        assert_eq!(second.command, "sh -c \"sleep 30\"");

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_crash_loop_ends_errored() {
        let crasher = shell("crasher", "exit 3").with_restart(policy(true, 2));
        let supervisor = Supervisor::new(DescriptorSet::new(vec![crasher]).unwrap());

        supervisor.start("crasher").await.unwrap();
        let info = wait_for_status(&supervisor, "crasher", ProcessStatus::Errored).await;

        assert_eq!(info.restarts, 2);
        assert_eq!(info.last_exit_code, Some(3));
        assert!(info.pid.is_none());
    }

    #[tokio::test]
    async fn test_no_autorestart_stops_after_exit() {
        let once = shell("once", "exit 0").with_restart(policy(false, 16));
        let supervisor = Supervisor::new(DescriptorSet::new(vec![once]).unwrap());

        supervisor.start("once").await.unwrap();
        let info = wait_for_status(&supervisor, "once", ProcessStatus::Stopped).await;

        assert_eq!(info.restarts, 0);
        assert_eq!(info.last_exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_start_failure_marks_errored() {
        let missing = ProcessDescriptor::new("bot", "bot.py")
            .with_interpreter("python3")
            .with_cwd("/nonexistent/launchset");
        let supervisor = Supervisor::new(DescriptorSet::new(vec![missing]).unwrap());

        assert!(supervisor.start("bot").await.is_err());
        assert_eq!(
            supervisor.info("bot").await.unwrap().status,
            ProcessStatus::Errored
        );
    }

    #[tokio::test]
    async fn test_unknown_process() {
        let supervisor = Supervisor::new(DescriptorSet::new(vec![shell("a", "true")]).unwrap());
        assert!(matches!(
            supervisor.start("b").await,
            Err(LaunchsetError::ProcessNotFound(name)) if name == "b"
        ));
        assert!(supervisor.stop("b").await.is_err());
        assert!(supervisor.info("b").await.is_err());
    }

    #[tokio::test]
    async fn test_start_all_keeps_processes_independent() {
        let broken = ProcessDescriptor::new("broken", "definitely-not-a-real-binary-42")
            .with_cwd(std::env::temp_dir());
        let set = DescriptorSet::new(vec![broken, shell("sleeper", "sleep 30")]).unwrap();
        let supervisor = Supervisor::new(set);

        let infos = supervisor.start_all().await;
        assert_eq!(infos[0].name, "broken");
        assert_eq!(infos[0].status, ProcessStatus::Errored);
        assert_eq!(infos[1].status, ProcessStatus::Online);

        let infos = supervisor.stop_all().await;
        assert!(infos.iter().all(|info| !info.status.is_running()));
    }

    #[tokio::test]
    async fn test_second_stop_waits_for_child_to_exit() {
        let marker = std::env::temp_dir().join(format!("launchset-{}", Uuid::new_v4()));
        let set = DescriptorSet::new(vec![stubborn("stubborn", &marker)]).unwrap();
        let supervisor = Supervisor::new(set);

        let first = supervisor.start("stubborn").await.unwrap();
        let old_pid = first.pid.unwrap();
        wait_for_file(&marker).await;

        let background = supervisor.clone();
        let first_stop = tokio::spawn(async move { background.stop("stubborn").await });
        wait_for_status(&supervisor, "stubborn", ProcessStatus::Stopping).await;

        let began = Instant::now();
        let stopped = supervisor.stop("stubborn").await.unwrap();
        assert_eq!(stopped.status, ProcessStatus::Stopped);
        assert!(stopped.pid.is_none());
        assert!(began.elapsed() >= Duration::from_millis(1_000));
        assert!(!is_alive(old_pid));

        let second = supervisor.start("stubborn").await.unwrap();
        assert_eq!(second.status, ProcessStatus::Online);
        assert_ne!(second.run_id, first.run_id);

        first_stop.await.unwrap().unwrap();
        let info = supervisor.info("stubborn").await.unwrap();
        assert_eq!(info.status, ProcessStatus::Online);
        assert_eq!(info.run_id, second.run_id);
        assert_eq!(info.pid, second.pid);

        supervisor.stop_all().await;
        let _ = std::fs::remove_file(&marker);
    }

    #[tokio::test]
    async fn test_stop_during_restart_delay() {
        let crasher = shell("crasher", "exit 1").with_restart(RestartPolicy {
            restart_delay_ms: 60_000,
            ..policy(true, 5)
        });
        let supervisor = Supervisor::new(DescriptorSet::new(vec![crasher]).unwrap());

        supervisor.start("crasher").await.unwrap();
        wait_for_status(&supervisor, "crasher", ProcessStatus::Launching).await;

        let began = Instant::now();
        let info = supervisor.stop("crasher").await.unwrap();
        assert!(began.elapsed() < Duration::from_secs(5));
        assert_eq!(info.status, ProcessStatus::Stopped);
        assert_eq!(info.restarts, 0);
        assert_eq!(info.last_exit_code, Some(1));
        assert!(info.pid.is_none());
    }

    #[tokio::test]
    async fn test_long_runs_reset_crash_counter() {
        let flaky = shell("flaky", "sleep 0.3; exit 2").with_restart(RestartPolicy {
            min_uptime_ms: 100,
            ..policy(true, 0)
        });
        let supervisor = Supervisor::new(DescriptorSet::new(vec![flaky]).unwrap());

        supervisor.start("flaky").await.unwrap();
        let info = wait_until(&supervisor, "flaky", |info| {
            info.restarts >= 2 || info.status == ProcessStatus::Errored
        })
        .await;
        assert_ne!(info.status, ProcessStatus::Errored);
        assert_eq!(info.last_exit_code, Some(2));

        supervisor.stop_all().await;
    }
}
