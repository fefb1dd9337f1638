//! Agent Daemon: the single-threaded cooperative dispatch loop that owns
//! every manager's task-queue drain and timer tick (spec.md section 5).
//!
//! Managers register under a priority (lower runs first in a tick, so
//! e.g. routing-domain and bridge-domain renders land before endpoint
//! renders that depend on them); C4's connection listeners and C6's
//! switch-reader thread trampoline into this loop via `on_reconnect_resync`
//! and `notify` rather than touching manager state directly.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use opflex_common::{Orch, OrchContext};
use tokio::sync::{mpsc, RwLock};

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;

/// Default tick cadence for the dispatch loop.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);

/// An out-of-band signal delivered to `run()` from outside the loop task —
/// typically a `SwitchConnection::on_message`/`on_connect` listener, which
/// cannot take `&mut AgentDaemon` since it runs inline with the connection's
/// read loop.
pub enum AgentEvent {
    Notification(String),
    ReconnectResync,
    /// Requests a status dump to the log, e.g. from a SIGUSR1 handler that
    /// can't borrow `&AgentDaemon` while `run()` holds it mutably.
    DumpRequested,
}

/// Priority-ordered dispatch loop driving every registered manager.
pub struct AgentDaemon {
    tick_interval: Duration,
    managers: BTreeMap<i32, Vec<Box<dyn Orch>>>,
    context: Arc<RwLock<OrchContext>>,
    stopping: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
    event_rx: mpsc::UnboundedReceiver<AgentEvent>,
}

impl AgentDaemon {
    pub fn new(tick_interval: Duration) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            tick_interval,
            managers: BTreeMap::new(),
            context: Arc::new(RwLock::new(OrchContext::default())),
            stopping: Arc::new(AtomicBool::new(false)),
            event_tx,
            event_rx,
        }
    }

    /// A cloneable sender for posting [`AgentEvent`]s from a connection
    /// listener or any other context that can't borrow `&mut self`.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<AgentEvent> {
        self.event_tx.clone()
    }

    pub fn context(&self) -> Arc<RwLock<OrchContext>> {
        Arc::clone(&self.context)
    }

    /// Registers a manager under its own reported priority.
    pub fn register(&mut self, manager: Box<dyn Orch>) {
        let priority = manager.priority();
        let name = manager.name().to_string();
        info!("registering {name} at priority {priority}");

        let record = AuditRecord::new(AuditCategory::ResourceCreate, "AgentDaemon", format!("register_manager: {name}"))
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&name)
            .with_object_type("manager")
            .with_details(serde_json::json!({ "priority": priority }));
        audit_log!(record);

        self.managers.entry(priority).or_default().push(manager);
    }

    /// Runs the dispatch loop until [`stop`](Self::stop) is called.
    pub async fn run(&mut self) {
        let manager_count: usize = self.managers.values().map(|v| v.len()).sum();
        info!("starting agent dispatch loop with {manager_count} managers");

        let record = AuditRecord::new(AuditCategory::SystemLifecycle, "AgentDaemon", "event_loop_started")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({ "manager_count": manager_count }));
        audit_log!(record);

        while !self.stopping.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {
                    for managers in self.managers.values_mut() {
                        for manager in managers.iter_mut() {
                            manager.on_timer();
                            if manager.has_pending_tasks() {
                                debug!("dispatching {}", manager.name());
                                manager.do_task().await;
                            }
                        }
                    }
                }
                Some(event) = self.event_rx.recv() => {
                    match event {
                        AgentEvent::Notification(n) => {
                            for managers in self.managers.values_mut() {
                                for manager in managers.iter_mut() {
                                    manager.on_notification(&n);
                                }
                            }
                        }
                        AgentEvent::ReconnectResync => {
                            for managers in self.managers.values_mut() {
                                for manager in managers.iter_mut() {
                                    manager.on_reconnect_resync();
                                }
                            }
                        }
                        AgentEvent::DumpRequested => {
                            for line in self.dump() {
                                info!("{line}");
                            }
                        }
                    }
                }
            }
        }

        info!("agent dispatch loop stopped");
        let record = AuditRecord::new(AuditCategory::SystemLifecycle, "AgentDaemon", "event_loop_stopped")
            .with_outcome(AuditOutcome::Success);
        audit_log!(record);
    }

    /// Sets the volatile stopping flag (spec.md section 5): the loop exits
    /// after it finishes draining the tick in progress.
    pub fn stop(&self) {
        info!("stop requested");
        let record = AuditRecord::new(AuditCategory::AdminAction, "AgentDaemon", "stop_requested")
            .with_outcome(AuditOutcome::Success);
        audit_log!(record);
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Returns a cloneable handle to the stopping flag, e.g. for a signal
    /// handler to request shutdown from outside the loop task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopping)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Forwards a post-reconnect resync signal to every registered manager,
    /// once C6 has re-dumped switch state and C9 has diffed it against the
    /// cached `TableState`.
    pub fn on_reconnect_resync(&mut self) {
        for managers in self.managers.values_mut() {
            for manager in managers.iter_mut() {
                manager.on_reconnect_resync();
            }
        }
    }

    /// Forwards an asynchronous notification (packet-in, port-status,
    /// flow-removed) to every registered manager.
    pub fn notify(&mut self, notification: &str) {
        for managers in self.managers.values_mut() {
            for manager in managers.iter_mut() {
                manager.on_notification(notification);
            }
        }
    }

    /// Dumps per-manager pending-task counts, wired to a SIGUSR1 status
    /// dump in `main`.
    pub fn dump(&self) -> Vec<String> {
        let mut lines = vec![format!("AgentDaemon stopping: {}", self.stopping.load(Ordering::SeqCst))];
        for (priority, managers) in &self.managers {
            for manager in managers {
                lines.push(format!(
                    "  [{:3}] {} - {} pending",
                    priority,
                    manager.name(),
                    manager.dump_pending_tasks().len()
                ));
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct TestManager {
        name: String,
        priority: i32,
        ticks: Arc<AtomicU32>,
        pending: bool,
    }

    impl TestManager {
        fn new(name: &str, priority: i32) -> Self {
            Self { name: name.to_string(), priority, ticks: Arc::new(AtomicU32::new(0)), pending: false }
        }

        fn with_pending(mut self) -> Self {
            self.pending = true;
            self
        }
    }

    #[async_trait]
    impl Orch for TestManager {
        fn name(&self) -> &str {
            &self.name
        }

        async fn do_task(&mut self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn has_pending_tasks(&self) -> bool {
            self.pending
        }
    }

    #[tokio::test]
    async fn test_register_orders_by_priority() {
        let mut daemon = AgentDaemon::new(Duration::from_millis(1));
        daemon.register(Box::new(TestManager::new("late", 100)));
        daemon.register(Box::new(TestManager::new("early", -10)));
        daemon.register(Box::new(TestManager::new("mid", 50)));

        let priorities: Vec<i32> = daemon.managers.keys().copied().collect();
        assert_eq!(priorities, vec![-10, 50, 100]);
    }

    #[tokio::test]
    async fn test_run_dispatches_pending_managers_then_stops() {
        let mut daemon = AgentDaemon::new(Duration::from_millis(1));
        let counter = Arc::new(AtomicU32::new(0));
        let mut manager = TestManager::new("m", 0).with_pending();
        manager.ticks = counter.clone();
        daemon.register(Box::new(manager));

        let stop_flag = daemon.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            stop_flag.store(true, Ordering::SeqCst);
        });
        daemon.run().await;

        assert!(counter.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_stop_sets_stopping_flag() {
        let daemon = AgentDaemon::new(Duration::from_millis(1));
        assert!(!daemon.is_stopping());
        daemon.stop();
        assert!(daemon.is_stopping());
    }

    #[tokio::test]
    async fn test_dump_reports_pending_counts() {
        let mut daemon = AgentDaemon::new(Duration::from_millis(1));
        daemon.register(Box::new(TestManager::new("idle", 0)));
        daemon.register(Box::new(TestManager::new("busy", 5).with_pending()));

        let lines = daemon.dump();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().any(|l| l.contains("idle") && l.contains("0 pending")));
    }

    #[tokio::test]
    async fn test_event_sender_delivers_notification_to_managers() {
        struct NotedManager {
            seen: Arc<std::sync::Mutex<Vec<String>>>,
        }
        #[async_trait]
        impl Orch for NotedManager {
            fn name(&self) -> &str {
                "noted"
            }
            async fn do_task(&mut self) {}
            fn on_notification(&mut self, notification: &str) {
                self.seen.lock().unwrap().push(notification.to_string());
            }
        }

        let mut daemon = AgentDaemon::new(Duration::from_millis(1));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        daemon.register(Box::new(NotedManager { seen: seen.clone() }));

        let tx = daemon.event_sender();
        let stop_flag = daemon.stop_handle();
        tx.send(AgentEvent::Notification("packet-in".into())).unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            stop_flag.store(true, Ordering::SeqCst);
        });
        daemon.run().await;

        assert_eq!(seen.lock().unwrap().as_slice(), &["packet-in".to_string()]);
    }

    #[tokio::test]
    async fn test_context_handle_is_shared() {
        let daemon = AgentDaemon::new(Duration::from_millis(1));
        let ctx1 = daemon.context();
        let ctx2 = daemon.context();
        assert!(Arc::ptr_eq(&ctx1, &ctx2));
    }
}
