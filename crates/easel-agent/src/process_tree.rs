//! Best-effort termination of an instance and everything it spawned.

#[cfg(target_os = "linux")]
fn parent_of(pid: u32) -> Option<u32> {
    let s = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    rest.split_whitespace().nth(1)?.parse().ok()
}

/// Descendants of `root`, deepest first.
#[cfg(target_os = "linux")]
pub fn descendants(root: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let pairs: Vec<(u32, u32)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(|pid| Some((pid, parent_of(pid)?)))
        .collect();

    let mut order = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, _) in pairs.iter().filter(|(_, ppid)| *ppid == parent) {
            if *pid != root && !order.contains(pid) {
                order.push(*pid);
                frontier.push(*pid);
            }
        }
    }
    order.reverse();
    order
}

#[cfg(not(target_os = "linux"))]
pub fn descendants(_root: u32) -> Vec<u32> {
    Vec::new()
}

#[cfg(unix)]
fn signal(pid: i32, sig: libc::c_int) {
    let rc = unsafe { libc::kill(pid, sig) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, error = %err, "signal failed (ignored)");
        }
    }
}

#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    pid > 0 && unsafe { libc::kill(pid, 0) } == 0
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// SIGTERM every descendant (children before parents), then the root and
/// its process group. Never fails.
#[cfg(unix)]
pub async fn terminate_tree(pid: u32) {
    let Ok(root) = i32::try_from(pid) else {
        return;
    };
    if root <= 1 {
        tracing::warn!(pid, "refusing to signal reserved pid");
        return;
    }
    for child in descendants(pid) {
        if let Ok(child) = i32::try_from(child) {
            signal(child, libc::SIGTERM);
        }
    }
    signal(root, libc::SIGTERM);
    // Instances run in their own session, so the group id is the root pid.
    signal(-root, libc::SIGTERM);
    tracing::info!(pid, "terminated process tree");
}

#[cfg(windows)]
pub async fn terminate_tree(pid: u32) {
    let res = crate::command::CommandSpec::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .run()
        .await;
    crate::best_effort::log_failure("taskkill", res);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn terminates_children_and_parent() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let mut kids = Vec::new();
        for _ in 0..50 {
            kids = descendants(pid);
            if !kids.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!kids.is_empty());
        assert!(is_alive(pid));

        terminate_tree(pid).await;
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reserved_pids_are_ignored() {
        terminate_tree(0).await;
        terminate_tree(1).await;
        assert!(!is_alive(0));
    }
}
