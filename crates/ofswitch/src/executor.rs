//! Flow Executor (C7): submits flow/group edits to the switch, optionally
//! blocking until a barrier reply confirms every edit was accepted.

use std::collections::HashMap;
use std::sync::Arc;

use log::error;
use tokio::sync::{oneshot, Mutex};

use crate::conn::SwitchConnection;
use crate::error::{OfError, OfResult};
use crate::flow::FlowEdit;
use crate::types::Xid;

struct RequestState {
    req_xids: Vec<Xid>,
    completion: Option<oneshot::Sender<OfResult<()>>>,
}

/// Submits edits to a [`SwitchConnection`] and correlates barrier replies
/// and error messages back to the caller.
pub struct FlowExecutor {
    conn: Arc<SwitchConnection>,
    requests: Arc<Mutex<HashMap<Xid, RequestState>>>,
    edit_to_barrier: Arc<Mutex<HashMap<Xid, Xid>>>,
}

impl FlowExecutor {
    pub fn new(conn: Arc<SwitchConnection>) -> Self {
        Self {
            conn,
            requests: Arc::new(Mutex::new(HashMap::new())),
            edit_to_barrier: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sends every edit followed by a barrier request, and blocks until
    /// the barrier reply arrives or any correlated edit is rejected
    /// (fail fast: the first error completes the call, remaining replies
    /// are still consumed by [`Self::handle_barrier_reply`]/[`Self::handle_error`]
    /// but ignored for this call's result).
    pub async fn execute(
        &self,
        edits: &[FlowEdit],
        mut encode_edit: impl FnMut(&FlowEdit, Xid) -> Vec<u8>,
        encode_barrier: impl FnOnce(Xid) -> Vec<u8>,
    ) -> OfResult<()> {
        let mut req_xids = Vec::with_capacity(edits.len());
        for edit in edits {
            let xid = self.conn.next_xid().await;
            self.conn.send(encode_edit(edit, xid)).await?;
            req_xids.push(xid);
        }

        let barrier_xid = self.conn.next_xid().await;
        let (tx, rx) = oneshot::channel();

        {
            let mut edit_to_barrier = self.edit_to_barrier.lock().await;
            for xid in &req_xids {
                edit_to_barrier.insert(*xid, barrier_xid);
            }
            self.requests.lock().await.insert(
                barrier_xid,
                RequestState { req_xids, completion: Some(tx) },
            );
        }

        self.conn.send(encode_barrier(barrier_xid)).await?;

        rx.await.unwrap_or(Err(OfError::internal("executor dropped before completion")))
    }

    /// Sends every edit without waiting for confirmation.
    pub async fn execute_no_block(
        &self,
        edits: &[FlowEdit],
        mut encode_edit: impl FnMut(&FlowEdit, Xid) -> Vec<u8>,
    ) -> OfResult<()> {
        for edit in edits {
            let xid = self.conn.next_xid().await;
            self.conn.send(encode_edit(edit, xid)).await?;
        }
        Ok(())
    }

    /// Completes the outstanding `execute` call correlated with this
    /// barrier xid, if any.
    pub async fn handle_barrier_reply(&self, xid: Xid) {
        if let Some(mut state) = self.requests.lock().await.remove(&xid) {
            let mut edit_to_barrier = self.edit_to_barrier.lock().await;
            for req_xid in &state.req_xids {
                edit_to_barrier.remove(req_xid);
            }
            if let Some(tx) = state.completion.take() {
                let _ = tx.send(Ok(()));
            }
        }
    }

    /// Handles an error message. If its xid correlates to an outstanding
    /// request, fails that request immediately; otherwise just logs.
    pub async fn handle_error(&self, xid: Xid, error_type: u16, code: u16) {
        let barrier_xid = { self.edit_to_barrier.lock().await.get(&xid).copied() };
        let Some(barrier_xid) = barrier_xid else {
            error!("unsolicited switch error xid={xid} type={error_type} code={code}");
            return;
        };

        if let Some(state) = self.requests.lock().await.get_mut(&barrier_xid) {
            if let Some(tx) = state.completion.take() {
                let of_error_type = crate::error::OfErrorType::from_raw(error_type);
                let _ = tx.send(Err(OfError::switch_rejected(of_error_type, code)));
            }
        }
    }

    pub async fn outstanding_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Action, Match};
    use crate::types::{Cookie, PortNo, TableId};
    use crate::flow::FlowEntry;

    fn sample_edit() -> FlowEdit {
        FlowEdit::Add(FlowEntry {
            table: TableId(0),
            priority: 1,
            cookie: Cookie(0),
            match_: Match::builder().eth_type(0x0800).build(),
            instructions: vec![Action::Output(PortNo(1))],
        })
    }

    async fn connected() -> (Arc<SwitchConnection>, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
        let (conn, rx) = SwitchConnection::new("br0");
        conn.begin_connecting().await;
        conn.complete_handshake().await;
        (Arc::new(conn), rx)
    }

    #[tokio::test]
    async fn test_execute_completes_on_barrier_reply() {
        let (conn, mut rx) = connected().await;
        let executor = Arc::new(FlowExecutor::new(conn));
        let exec2 = executor.clone();

        let handle = tokio::spawn(async move {
            exec2
                .execute(&[sample_edit()], |_, xid| xid.0.to_be_bytes().to_vec(), |xid| xid.0.to_be_bytes().to_vec())
                .await
        });

        // drain the edit send then the barrier send
        let _edit_bytes = rx.recv().await.unwrap();
        let barrier_bytes = rx.recv().await.unwrap();
        let barrier_xid = Xid(u32::from_be_bytes(barrier_bytes.try_into().unwrap()));

        executor.handle_barrier_reply(barrier_xid).await;
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_execute_fails_fast_on_correlated_error() {
        let (conn, mut rx) = connected().await;
        let executor = Arc::new(FlowExecutor::new(conn));
        let exec2 = executor.clone();

        let handle = tokio::spawn(async move {
            exec2
                .execute(&[sample_edit()], |_, xid| xid.0.to_be_bytes().to_vec(), |xid| xid.0.to_be_bytes().to_vec())
                .await
        });

        let edit_bytes = rx.recv().await.unwrap();
        let _barrier_bytes = rx.recv().await.unwrap();
        let edit_xid = Xid(u32::from_be_bytes(edit_bytes.try_into().unwrap()));

        executor.handle_error(edit_xid, 5, 2).await;
        let result = handle.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_execute_no_block_does_not_wait() {
        let (conn, mut rx) = connected().await;
        let executor = FlowExecutor::new(conn);
        executor
            .execute_no_block(&[sample_edit()], |_, xid| xid.0.to_be_bytes().to_vec())
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());
        assert_eq!(executor.outstanding_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsolicited_error_is_logged_not_fatal() {
        let (conn, _rx) = connected().await;
        let executor = FlowExecutor::new(conn);
        executor.handle_error(Xid(999), 1, 1).await;
    }
}
