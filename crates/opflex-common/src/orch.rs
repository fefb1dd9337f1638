//! Base Orch trait and context shared by every manager in the agent loop.

use async_trait::async_trait;

/// Context shared across all managers.
///
/// Populated by the switch connection (C4) and the daemon, and read by
/// every manager that needs to gate work on switch/agent readiness.
#[derive(Debug, Clone)]
pub struct OrchContext {
    /// True once the port mapper has a complete name<->ofport mapping.
    pub all_ports_ready: bool,
    /// True while a reconnect-and-resync cycle is in progress (C4/C9).
    pub resync_in_progress: bool,
    /// True while the switch connection is CONNECTED and healthy.
    pub system_healthy: bool,
}

impl Default for OrchContext {
    fn default() -> Self {
        Self {
            all_ports_ready: false,
            resync_in_progress: false,
            system_healthy: true,
        }
    }
}

/// Base trait for all managers that participate in the agent loop.
///
/// Each manager implements this trait to be driven by the daemon's
/// priority-ordered dispatch loop (spec.md section 5, section 9's
/// DAG-of-creation-steps note).
///
/// # Lifecycle
///
/// 1. Construction: manager is created with the switch handles (C4-C7) it needs.
/// 2. Registration: manager registers with the daemon under a priority.
/// 3. Event loop: `do_task()` is called whenever `has_pending_tasks()` is true.
/// 4. Reconnect: `on_reconnect_resync()` runs after C6 has re-dumped switch
///    state and C9 has diffed it against cached `TableState`.
/// 5. Shutdown: manager is dropped.
///
/// # Thread safety
///
/// Managers must be `Send + Sync`: the switch connection's read loop runs on
/// its own task and forwards decoded messages into the agent loop, so a
/// manager may in principle be observed from more than one task even though
/// only the agent loop task ever calls these methods.
#[async_trait]
pub trait Orch: Send + Sync {
    /// Returns the name of this manager (for logging and debugging).
    fn name(&self) -> &str;

    /// Processes pending tasks from this manager's task queue.
    ///
    /// Implementations should:
    /// 1. Drain ready entries from the task queue (C8).
    /// 2. Translate each entry into flow/group edits (C2) and submit them (C7).
    /// 3. Classify failures per the error taxonomy and retry or drop accordingly.
    async fn do_task(&mut self);

    /// Returns the priority of this manager (lower = higher priority).
    ///
    /// Managers with lower priority values are dispatched first in a given
    /// tick, so that e.g. routing-domain and bridge-domain renders run
    /// before endpoint renders that depend on them. Default is 0.
    fn priority(&self) -> i32 {
        0
    }

    /// Returns true if this manager has pending work.
    fn has_pending_tasks(&self) -> bool {
        false
    }

    /// Dumps pending tasks for debugging (wired to a SIGUSR1 status dump).
    fn dump_pending_tasks(&self) -> Vec<String> {
        vec![]
    }

    /// Called after a reconnect once C6 has re-dumped switch state and C9
    /// has diffed it against the cached `TableState`. This is the
    /// generalization of a warm-restart callback: state is resynced, not
    /// reprogrammed blindly.
    fn on_reconnect_resync(&mut self) {
        // Default: no-op
    }

    /// Called periodically by the daemon's timer.
    fn on_timer(&mut self) {
        // Default: no-op
    }

    /// Handles an asynchronous notification from the switch connection
    /// (e.g. packet-in, port status change, flow-removed).
    fn on_notification(&mut self, _notification: &str) {
        // Default: no-op
    }
}

/// Trait for managers that follow the simplified request-based pattern.
#[async_trait]
pub trait Orch2: Orch {
    /// The request type this manager processes.
    type Request;

    /// Processes an add/update operation.
    async fn add_operation(&mut self, request: &Self::Request) -> crate::TaskResult<()>;

    /// Processes a delete operation.
    async fn del_operation(&mut self, request: &Self::Request) -> crate::TaskResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestOrch {
        name: String,
        task_count: usize,
    }

    #[async_trait]
    impl Orch for TestOrch {
        fn name(&self) -> &str {
            &self.name
        }

        async fn do_task(&mut self) {
            self.task_count += 1;
        }

        fn has_pending_tasks(&self) -> bool {
            self.task_count < 10
        }
    }

    #[tokio::test]
    async fn test_orch_trait() {
        let mut orch = TestOrch {
            name: "test".to_string(),
            task_count: 0,
        };

        assert_eq!(orch.name(), "test");
        assert!(orch.has_pending_tasks());

        orch.do_task().await;
        assert_eq!(orch.task_count, 1);
    }

    #[test]
    fn test_orch_context_default() {
        let ctx = OrchContext::default();
        assert!(!ctx.all_ports_ready);
        assert!(!ctx.resync_in_progress);
        assert!(ctx.system_healthy);
    }
}
