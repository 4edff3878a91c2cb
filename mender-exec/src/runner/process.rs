use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::Child;
use tracing::debug;

/// Kill `child` and every process it spawned.
///
/// Descendants go first so a shell cannot restart them after its own death.
pub async fn terminate_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        match tokio::task::spawn_blocking(move || kill_descendants(pid)).await {
            Ok(killed) if killed > 0 => debug!(pid, killed, "killed descendant processes"),
            Ok(_) => {}
            Err(err) => debug!(pid, error = %err, "descendant sweep failed"),
        }
    }
    if let Err(err) = child.kill().await {
        debug!(error = %err, "kill failed (process already gone?)");
    }
}

/// Pids of every live process below `root`, parents before children.
pub fn descendant_pids(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    collect_descendants(&system, Pid::from_u32(root))
        .into_iter()
        .map(|p| p.as_u32())
        .collect()
}

fn kill_descendants(root: u32) -> usize {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    collect_descendants(&system, Pid::from_u32(root))
        .into_iter()
        .filter(|pid| system.process(*pid).is_some_and(|p| p.kill()))
        .count()
}

fn collect_descendants(system: &System, root: Pid) -> Vec<Pid> {
    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) && !found.contains(pid) {
                found.push(*pid);
                frontier.push(*pid);
            }
        }
    }
    found
}
