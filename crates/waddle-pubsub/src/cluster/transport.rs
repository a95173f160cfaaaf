//! Cluster transports.
//!
//! The engine only needs "run this task on member X", "send this task to
//! everybody else" and "run this task everywhere and collect the outcomes".
//! [`StandaloneTransport`] serves a single process; [`InProcessCluster`]
//! wires several engines inside one process through per-member queues, with
//! every task going through the binary codec.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::lock;

use super::codec::{decode_task, encode_task, CodecError};
use super::{ClusterTask, TaskOutcome};

/// Identifies a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cluster transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// No such member.
    #[error("Unknown cluster member: {0}")]
    UnknownMember(MemberId),

    /// The member cannot be reached.
    #[error("Cluster member unreachable: {0}")]
    Unreachable(MemberId),

    /// The member did not answer in time.
    #[error("Cluster member timed out: {0}")]
    Timeout(MemberId),

    /// The task could not be decoded.
    #[error("Task codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Runs tasks received from the cluster against local state.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one task.
    async fn execute(&self, task: ClusterTask) -> TaskOutcome;
}

/// Outcome reported by one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReply {
    /// Reporting member.
    pub member: MemberId,
    /// Its local outcome.
    pub outcome: TaskOutcome,
}

/// Ships cluster tasks between members.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// This member.
    fn local_member(&self) -> &MemberId;

    /// Every member currently known, including this one.
    fn members(&self) -> Vec<MemberId>;

    /// Install the executor for tasks addressed to this member.
    fn bind(&self, executor: Arc<dyn TaskExecutor>);

    /// Run a task on one member and wait for its outcome.
    async fn run_task_on_member(
        &self,
        task: &ClusterTask,
        member: &MemberId,
    ) -> Result<TaskOutcome, ClusterError>;

    /// Send a task to every other member without waiting.
    fn broadcast_task(&self, task: &ClusterTask);

    /// Run a task on every reachable member and collect the outcomes that
    /// arrive before the timeout.
    async fn do_synchronous_cluster_task(
        &self,
        task: &ClusterTask,
        include_local: bool,
    ) -> Vec<TaskReply>;
}

/// Transport for a process that is not part of a cluster.
pub struct StandaloneTransport {
    member: MemberId,
    executor: RwLock<Option<Arc<dyn TaskExecutor>>>,
}

impl StandaloneTransport {
    /// Create a standalone transport.
    pub fn new() -> Self {
        Self {
            member: MemberId::new("local"),
            executor: RwLock::new(None),
        }
    }

    fn executor(&self) -> Option<Arc<dyn TaskExecutor>> {
        lock::read(&self.executor).clone()
    }
}

impl Default for StandaloneTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterTransport for StandaloneTransport {
    fn local_member(&self) -> &MemberId {
        &self.member
    }

    fn members(&self) -> Vec<MemberId> {
        vec![self.member.clone()]
    }

    fn bind(&self, executor: Arc<dyn TaskExecutor>) {
        *lock::write(&self.executor) = Some(executor);
    }

    async fn run_task_on_member(
        &self,
        task: &ClusterTask,
        member: &MemberId,
    ) -> Result<TaskOutcome, ClusterError> {
        if *member != self.member {
            return Err(ClusterError::UnknownMember(member.clone()));
        }
        match self.executor() {
            Some(executor) => Ok(executor.execute(task.clone()).await),
            None => Err(ClusterError::Unreachable(member.clone())),
        }
    }

    fn broadcast_task(&self, _task: &ClusterTask) {}

    async fn do_synchronous_cluster_task(
        &self,
        task: &ClusterTask,
        include_local: bool,
    ) -> Vec<TaskReply> {
        if !include_local {
            return Vec::new();
        }
        match self.executor() {
            Some(executor) => vec![TaskReply {
                member: self.member.clone(),
                outcome: executor.execute(task.clone()).await,
            }],
            None => Vec::new(),
        }
    }
}

struct Envelope {
    payload: Bytes,
    reply: Option<oneshot::Sender<TaskOutcome>>,
}

struct MemberSlot {
    inbox: mpsc::UnboundedSender<Envelope>,
    reachable: AtomicBool,
}

struct ClusterInner {
    members: DashMap<MemberId, Arc<MemberSlot>>,
    timeout: Duration,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// A cluster of engines living in one process.
///
/// Each member has its own FIFO queue drained by one worker, so tasks from
/// one sender are applied in order.
#[derive(Clone)]
pub struct InProcessCluster {
    inner: Arc<ClusterInner>,
}

impl InProcessCluster {
    /// Create an empty cluster. `timeout` bounds synchronous tasks.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                members: DashMap::new(),
                timeout,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Add a member and return its transport.
    pub fn join(&self, member: impl Into<String>) -> InProcessTransport {
        let member = MemberId::new(member);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.members.insert(
            member.clone(),
            Arc::new(MemberSlot {
                inbox: tx,
                reachable: AtomicBool::new(true),
            }),
        );
        debug!(member = %member, "Member joined in-process cluster");

        InProcessTransport {
            member,
            cluster: self.clone(),
            inbox: Mutex::new(Some(rx)),
            executor: RwLock::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Remove a member. Queued tasks for it are dropped.
    pub fn leave(&self, member: &MemberId) {
        self.inner.members.remove(member);
    }

    /// Mark a member reachable or not. Tasks sent to an unreachable member
    /// are lost.
    pub fn set_reachable(&self, member: &MemberId, reachable: bool) {
        if let Some(slot) = self.inner.members.get(member) {
            slot.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    /// Wait until every queued task has been applied.
    pub async fn settle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn member_ids(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self
            .inner
            .members
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    fn send(
        &self,
        member: &MemberId,
        payload: Bytes,
        reply: Option<oneshot::Sender<TaskOutcome>>,
    ) -> Result<(), ClusterError> {
        let slot = self
            .inner
            .members
            .get(member)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ClusterError::UnknownMember(member.clone()))?;
        if !slot.reachable.load(Ordering::SeqCst) {
            return Err(ClusterError::Unreachable(member.clone()));
        }

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        if slot.inbox.send(Envelope { payload, reply }).is_err() {
            self.finished();
            return Err(ClusterError::Unreachable(member.clone()));
        }
        Ok(())
    }

    fn finished(&self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl fmt::Debug for InProcessCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessCluster")
            .field("members", &self.member_ids())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

/// One member's view of an [`InProcessCluster`].
pub struct InProcessTransport {
    member: MemberId,
    cluster: InProcessCluster,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    executor: RwLock<Option<Arc<dyn TaskExecutor>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessTransport {
    /// The cluster this member belongs to.
    pub fn cluster(&self) -> &InProcessCluster {
        &self.cluster
    }

    fn executor(&self) -> Option<Arc<dyn TaskExecutor>> {
        lock::read(&self.executor).clone()
    }

    async fn remote(
        &self,
        payload: Bytes,
        member: &MemberId,
    ) -> Result<TaskOutcome, ClusterError> {
        let (tx, rx) = oneshot::channel();
        self.cluster.send(member, payload, Some(tx))?;
        match tokio::time::timeout(self.cluster.inner.timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(ClusterError::Unreachable(member.clone())),
            Err(_) => Err(ClusterError::Timeout(member.clone())),
        }
    }
}

impl Drop for InProcessTransport {
    fn drop(&mut self) {
        if let Some(worker) = lock::lock(&self.worker).take() {
            worker.abort();
        }
    }
}

#[async_trait]
impl ClusterTransport for InProcessTransport {
    fn local_member(&self) -> &MemberId {
        &self.member
    }

    fn members(&self) -> Vec<MemberId> {
        self.cluster.member_ids()
    }

    fn bind(&self, executor: Arc<dyn TaskExecutor>) {
        *lock::write(&self.executor) = Some(Arc::clone(&executor));

        let Some(mut inbox) = lock::lock(&self.inbox).take() else {
            return;
        };
        let cluster = self.cluster.clone();
        let member = self.member.clone();

        let worker = tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                match decode_task(&envelope.payload) {
                    Ok(task) => {
                        trace!(member = %member, task = task.kind(), "Applying cluster task");
                        let outcome = executor.execute(task).await;
                        if let Some(reply) = envelope.reply {
                            let _ = reply.send(outcome);
                        }
                    }
                    Err(e) => {
                        warn!(member = %member, error = %e, "Dropping undecodable cluster task");
                    }
                }
                cluster.finished();
            }
        });
        *lock::lock(&self.worker) = Some(worker);
    }

    async fn run_task_on_member(
        &self,
        task: &ClusterTask,
        member: &MemberId,
    ) -> Result<TaskOutcome, ClusterError> {
        if *member == self.member {
            return match self.executor() {
                Some(executor) => Ok(executor.execute(task.clone()).await),
                None => Err(ClusterError::Unreachable(member.clone())),
            };
        }
        self.remote(encode_task(task), member).await
    }

    fn broadcast_task(&self, task: &ClusterTask) {
        let payload = encode_task(task);
        for member in self.cluster.member_ids() {
            if member == self.member {
                continue;
            }
            if let Err(e) = self.cluster.send(&member, payload.clone(), None) {
                debug!(member = %member, task = task.kind(), error = %e, "Broadcast not delivered");
            }
        }
    }

    async fn do_synchronous_cluster_task(
        &self,
        task: &ClusterTask,
        include_local: bool,
    ) -> Vec<TaskReply> {
        let payload = encode_task(task);
        let remotes = self
            .cluster
            .member_ids()
            .into_iter()
            .filter(|member| *member != self.member)
            .map(|member| {
                let payload = payload.clone();
                async move {
                    let result = self.remote(payload, &member).await;
                    (member, result)
                }
            });

        let local = async {
            if !include_local {
                return None;
            }
            let executor = self.executor()?;
            Some(TaskReply {
                member: self.member.clone(),
                outcome: executor.execute(task.clone()).await,
            })
        };

        let (local, remote) = futures::join!(local, join_all(remotes));

        let mut replies: Vec<TaskReply> = local.into_iter().collect();
        for (member, result) in remote {
            match result {
                Ok(outcome) => replies.push(TaskReply { member, outcome }),
                Err(e) => {
                    debug!(member = %member, task = task.kind(), error = %e, "No reply from member")
                }
            }
        }
        replies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::TaskNode;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ClusterTask>>,
    }

    #[async_trait]
    impl TaskExecutor for Recorder {
        async fn execute(&self, task: ClusterTask) -> TaskOutcome {
            lock::lock(&self.seen).push(task);
            TaskOutcome::Applied
        }
    }

    fn remove(node: &str) -> ClusterTask {
        ClusterTask::RemoveNode(TaskNode::new("pubsub", node))
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_keeps_order() {
        let cluster = InProcessCluster::new(Duration::from_secs(1));
        let a = cluster.join("a");
        let b = cluster.join("b");
        let a_seen = Arc::new(Recorder::default());
        let b_seen = Arc::new(Recorder::default());
        a.bind(a_seen.clone());
        b.bind(b_seen.clone());

        a.broadcast_task(&remove("one"));
        a.broadcast_task(&remove("two"));
        cluster.settle().await;

        assert!(lock::lock(&a_seen.seen).is_empty());
        assert_eq!(*lock::lock(&b_seen.seen), vec![remove("one"), remove("two")]);
    }

    #[tokio::test]
    async fn test_synchronous_task_collects_partial_results() {
        let cluster = InProcessCluster::new(Duration::from_millis(200));
        let a = cluster.join("a");
        let b = cluster.join("b");
        let c = cluster.join("c");
        for transport in [&a, &b, &c] {
            transport.bind(Arc::new(Recorder::default()));
        }
        cluster.set_reachable(&MemberId::new("c"), false);

        let replies = a
            .do_synchronous_cluster_task(&ClusterTask::Flush { node: None }, true)
            .await;
        let members: Vec<&str> = replies.iter().map(|r| r.member.as_str()).collect();
        assert_eq!(members, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unbound_member_times_out() {
        let cluster = InProcessCluster::new(Duration::from_millis(50));
        let a = cluster.join("a");
        let _b = cluster.join("b");
        a.bind(Arc::new(Recorder::default()));

        let result = a
            .run_task_on_member(&remove("x"), &MemberId::new("b"))
            .await;
        assert!(matches!(result, Err(ClusterError::Timeout(_))));
        assert!(matches!(
            a.run_task_on_member(&remove("x"), &MemberId::new("zz")).await,
            Err(ClusterError::UnknownMember(_))
        ));
    }

    #[tokio::test]
    async fn test_standalone_runs_locally_only() {
        let transport = StandaloneTransport::new();
        let recorder = Arc::new(Recorder::default());
        transport.bind(recorder.clone());

        transport.broadcast_task(&remove("x"));
        assert!(lock::lock(&recorder.seen).is_empty());

        let replies = transport
            .do_synchronous_cluster_task(&remove("x"), true)
            .await;
        assert_eq!(replies.len(), 1);
        assert!(transport
            .do_synchronous_cluster_task(&remove("x"), false)
            .await
            .is_empty());
    }
}
