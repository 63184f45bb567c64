//! NUMA placement strategy. Discovery reads the sysfs node topology on
//! Linux; everything is best-effort and a no-op elsewhere.

use std::sync::OnceLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    Disabled,
    /// Spread threads evenly across nodes.
    Distribute,
    /// Pin everything to the current node.
    Isolate,
    /// Inherit whatever numactl configured for the process.
    Numactl,
    /// Duplicate model buffers per node (placement only; the engine does
    /// not copy).
    Mirror,
}

#[derive(Debug, Clone)]
pub(crate) struct NumaState {
    pub strategy: Strategy,
    pub n_nodes: usize,
    pub current_node: usize,
}

static STATE: OnceLock<NumaState> = OnceLock::new();

/// Initialize NUMA handling once; later calls are ignored.
pub fn init(strategy: Strategy) {
    let state = STATE.get_or_init(|| {
        let n_nodes = detect_nodes();
        let current_node = current_node();
        debug!(?strategy, n_nodes, current_node, "numa init");
        if strategy != Strategy::Disabled && n_nodes <= 1 {
            warn!("numa requested but only one node detected");
        }
        NumaState {
            strategy,
            n_nodes,
            current_node,
        }
    });
    if state.strategy != strategy {
        warn!(
            "numa already initialized with {:?}, ignoring {:?}",
            state.strategy, strategy
        );
    }
}

pub fn is_enabled() -> bool {
    STATE
        .get()
        .map(|s| s.strategy != Strategy::Disabled && s.n_nodes > 1)
        .unwrap_or(false)
}

pub fn n_nodes() -> usize {
    STATE.get().map(|s| s.n_nodes).unwrap_or(1)
}

/// Node the initializing thread was running on.
pub fn home_node() -> usize {
    STATE.get().map(|s| s.current_node).unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn detect_nodes() -> usize {
    let mut n = 0;
    loop {
        let path = format!("/sys/devices/system/node/node{n}");
        if !std::path::Path::new(&path).exists() {
            break;
        }
        n += 1;
    }
    n.max(1)
}

#[cfg(not(target_os = "linux"))]
fn detect_nodes() -> usize {
    1
}

#[cfg(target_os = "linux")]
fn current_node() -> usize {
    let mut node = 0u32;
    let mut cpu = 0u32;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_getcpu,
            &mut cpu as *mut u32,
            &mut node as *mut u32,
            std::ptr::null_mut::<libc::c_void>(),
        )
    };
    if rc == 0 {
        node as usize
    } else {
        0
    }
}

#[cfg(not(target_os = "linux"))]
fn current_node() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(Strategy::Disabled);
        init(Strategy::Distribute); // ignored, already latched
        assert!(n_nodes() >= 1);
    }
}
