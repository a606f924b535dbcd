//! Process-tree termination.
//!
//! Commands are spawned as leaders of their own process group. Killing a
//! command means killing every descendant found in the process table, leaves
//! first, and then the whole group, so that neither re-parented children nor
//! children that left the group survive.

use std::collections::{HashMap, VecDeque};

/// Descendants of `root`, leaves first.
///
/// The table must be read before anything is killed: once a parent dies its
/// children are re-parented and the link to `root` is lost.
#[cfg(target_os = "linux")]
pub fn descendants(root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parse_ppid(&stat) {
            children.entry(ppid).or_default().push(pid);
        }
    }
    tree_order(root, &children)
}

/// Descendants of `root`; not available on this platform.
#[cfg(not(target_os = "linux"))]
pub fn descendants(_root: u32) -> Vec<u32> {
    Vec::new()
}

/// Breadth-first walk from `root`, reversed so the deepest processes come first.
fn tree_order(root: u32, children: &HashMap<u32, Vec<u32>>) -> Vec<u32> {
    let mut order = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for child in children.get(&pid).into_iter().flatten() {
            if *child != root && !order.contains(child) {
                order.push(*child);
                queue.push_back(*child);
            }
        }
    }
    order.reverse();
    order
}

/// Parent pid from the content of `/proc/<pid>/stat`.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_ppid(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    fields.next()?;
    fields.next()?.parse().ok()
}

/// Force-kill `pid`, its descendants and its process group.
#[cfg(unix)]
pub fn kill_tree(pid: u32) {
    let tree = descendants(pid);
    tracing::debug!(pid, descendants = tree.len(), "killing process tree");
    for child in tree {
        signal(child as i32, libc::SIGKILL);
    }
    signal(pid as i32, libc::SIGKILL);
    // SAFETY: killpg has no memory-safety preconditions. The group id is the
    // leader's pid because commands are spawned with `process_group(0)`.
    unsafe {
        libc::killpg(pid as i32, libc::SIGKILL);
    }
}

/// Force-kill `pid`; descendants are not tracked on this platform.
#[cfg(not(unix))]
pub fn kill_tree(pid: u32) {
    tracing::warn!(pid, "process tree kill not supported on this platform");
}

#[cfg(unix)]
fn signal(pid: i32, sig: i32) {
    if pid <= 0 {
        return;
    }
    // SAFETY: kill has no memory-safety preconditions; a stale pid yields ESRCH.
    unsafe {
        libc::kill(pid, sig);
    }
}

/// Kills a process tree when dropped, unless disarmed.
///
/// Held across the wait on a child so that a cancelled future does not leave
/// the tree running.
#[derive(Debug)]
pub struct TreeGuard {
    pid: Option<u32>,
}

impl TreeGuard {
    /// Guard the tree rooted at `pid`.
    pub fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    /// Kill the tree now and disarm.
    pub fn kill(&mut self) {
        if let Some(pid) = self.pid.take() {
            kill_tree(pid);
        }
    }

    /// Leave the tree alone on drop.
    pub fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for TreeGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            tracing::warn!(pid, "command dropped while running, killing process tree");
            kill_tree(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ppid() {
        assert_eq!(parse_ppid("1234 (sleep) S 1200 1234 1200 0"), Some(1200));
        assert_eq!(parse_ppid("77 (weird) name) R 5 77 5"), Some(5));
        assert_eq!(parse_ppid("garbage"), None);
    }

    #[test]
    fn test_tree_order_leaves_first() {
        let mut children = HashMap::new();
        children.insert(1, vec![2, 3]);
        children.insert(2, vec![4]);
        children.insert(4, vec![5]);
        children.insert(9, vec![10]);

        let order = tree_order(1, &children);
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], 5);
        assert!(!order.contains(&10));
        let pos = |p| order.iter().position(|x| *x == p).unwrap();
        assert!(pos(4) < pos(2));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_descendants_of_spawned_shell() {
        let mut child = std::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 5 & wait")
            .spawn()
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));

        let tree = descendants(child.id());
        assert!(!tree.is_empty());

        kill_tree(child.id());
        child.wait().unwrap();
    }
}
