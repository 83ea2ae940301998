//! Distributed coordinator: one actor per database
//!
//! The coordinator owns the membership set, the operation log, and the table
//! of active request contexts for a single database. Every mutating
//! operation (submission, response handling, membership changes, context
//! finalization) is funneled through one tokio task draining a command
//! channel, so those effects are totally ordered within a database while
//! different databases run fully in parallel.
//!
//! Quorum completion is detected cooperatively: a periodic tick re-evaluates
//! every active context in addition to the checks done as responses arrive.
//! That tolerates late and duplicate acknowledgements at the cost of
//! completion latency bounded by the poll interval.

use crate::common::{CoordinatorConfig, Error, NodeId, OperationId, Result};
use crate::coordinator::context::{RequestContext, ResponseHandler};
use crate::coordinator::log::{LogId, OperationLog};
use crate::coordinator::network::NetworkSender;
use crate::coordinator::requests::{NodeRequest, NodeResponse, SubmitRequest, SubmitResponse};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// State owned by the coordinator's worker task. Request variants reach it
/// through [`SubmitRequest::begin`]; nothing outside the worker ever holds a
/// reference.
pub struct CoordinatorState {
    database: String,
    config: CoordinatorConfig,
    members: HashSet<NodeId>,
    log: OperationLog,
    contexts: HashMap<LogId, RequestContext>,
    network: Arc<dyn NetworkSender>,
}

impl CoordinatorState {
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn members_len(&self) -> usize {
        self.members.len()
    }

    /// Append to the log, snapshot membership, register a context, and fan
    /// the request out. Completion is evaluated on each incoming response
    /// and on every tick; the submitter is answered through the network.
    pub fn send_operation(
        &mut self,
        requester: NodeId,
        operation_id: OperationId,
        node_request: NodeRequest,
        handler: Box<dyn ResponseHandler>,
        timeout: Duration,
    ) -> Option<LogId> {
        let id = match self.log.append(node_request.clone()) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(database = %self.database, error = %e, "log append failed");
                self.reply(
                    &requester,
                    &operation_id,
                    &SubmitResponse::Tx(crate::tx::TxOutcome::Failure {
                        message: e.to_string(),
                    }),
                );
                return None;
            }
        };

        let snapshot: Vec<NodeId> = self.members.iter().cloned().collect();
        let wire_request = node_request.clone();
        let context = RequestContext::new(
            id,
            requester,
            operation_id,
            node_request,
            snapshot.iter().cloned().collect(),
            handler,
            Instant::now() + timeout,
        );
        self.contexts.insert(id, context);

        self.network
            .send_request(&snapshot, &self.database, id, &wire_request);
        tracing::debug!(database = %self.database, request = %id, members = snapshot.len(), "operation dispatched");
        Some(id)
    }

    /// Forward a submit outcome to the original submitter.
    pub fn reply(&self, member: &NodeId, operation_id: &OperationId, response: &SubmitResponse) {
        self.network
            .reply(member, &self.database, operation_id, response);
    }

    /// Resend every log entry after `from` to a catching-up member.
    pub fn try_resend(&self, member: &NodeId, from: LogId) {
        let tail = self.log.entries_after(from);
        tracing::info!(
            database = %self.database,
            member = %member,
            from = %from,
            entries = tail.len(),
            "incremental resend"
        );
        for (id, request) in tail {
            self.network
                .send_request(std::slice::from_ref(member), &self.database, id, &request);
        }
    }

    /// Hand a member the full log, the basis of a fresh copy.
    pub fn send_full_sync(&self, member: &NodeId) {
        tracing::info!(
            database = %self.database,
            member = %member,
            entries = self.log.len(),
            "full sync"
        );
        for (id, request) in self.log.entries() {
            self.network
                .send_request(std::slice::from_ref(member), &self.database, *id, request);
        }
    }

    pub fn last_persistent_log(&self) -> Option<LogId> {
        self.log.last_persistent_log()
    }

    fn receive(&mut self, member: NodeId, log_id: LogId, response: NodeResponse) {
        let Some(context) = self.contexts.get_mut(&log_id) else {
            // Already finished, evicted, or stale: not an error.
            tracing::trace!(database = %self.database, request = %log_id, member = %member,
                "response for unknown request, ignoring");
            return;
        };
        context.receive(member, response);
        if let Some(reply) = context.check() {
            let requester = context.requester().clone();
            let operation_id = context.operation_id().clone();
            self.finish(log_id);
            self.reply(&requester, &operation_id, &reply);
        }
    }

    fn finish(&mut self, log_id: LogId) {
        self.contexts.remove(&log_id);
    }

    /// Periodic pass: finalize contexts whose policy is now satisfied and
    /// escalate the ones past their deadline.
    fn tick(&mut self) {
        let now = Instant::now();
        let ids: Vec<LogId> = self.contexts.keys().copied().collect();
        for id in ids {
            let Some(context) = self.contexts.get_mut(&id) else {
                continue;
            };
            if let Some(reply) = context.check() {
                let requester = context.requester().clone();
                let operation_id = context.operation_id().clone();
                self.finish(id);
                self.reply(&requester, &operation_id, &reply);
            } else if context.expired(now) {
                context.abandon();
                let requester = context.requester().clone();
                let operation_id = context.operation_id().clone();
                let (received, expected) = (context.received_len(), context.expected().len());
                tracing::warn!(
                    database = %self.database,
                    request = %id,
                    received,
                    expected,
                    "request deadline passed without quorum"
                );
                self.finish(id);
                self.reply(&requester, &operation_id, &SubmitResponse::Timeout);
            }
        }
    }

    fn abandon_all(&mut self) {
        for (id, context) in self.contexts.drain() {
            tracing::warn!(
                database = %self.database,
                request = %id,
                received = context.received_len(),
                "abandoning in-flight request at shutdown"
            );
        }
    }
}

enum Command {
    Submit {
        member: NodeId,
        operation_id: OperationId,
        request: SubmitRequest,
    },
    Receive {
        member: NodeId,
        log_id: LogId,
        response: NodeResponse,
    },
    Join(NodeId),
    Leave(NodeId),
    Log {
        request: NodeRequest,
        reply: oneshot::Sender<Result<LogId>>,
    },
    LastLog {
        reply: oneshot::Sender<Option<LogId>>,
    },
    ActiveContexts {
        reply: oneshot::Sender<usize>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a per-database coordinator actor.
///
/// Cheap to share; all methods enqueue onto the worker and return without
/// waiting for quorum.
pub struct DistributedCoordinator {
    database: String,
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    drain_timeout: Duration,
    closed: AtomicBool,
}

impl DistributedCoordinator {
    /// Spawn the worker for one database. The coordinator takes exclusive
    /// ownership of the operation log for the lifetime of the session.
    pub fn new(
        database: impl Into<String>,
        config: CoordinatorConfig,
        network: Arc<dyn NetworkSender>,
        log: OperationLog,
    ) -> Self {
        let database = database.into();
        let drain_timeout = config.drain_timeout();
        let poll_interval = config.poll_interval();

        let mut state = CoordinatorState {
            database: database.clone(),
            config,
            members: HashSet::new(),
            log,
            contexts: HashMap::new(),
            network,
        };

        let (commands, mut rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(async move {
            let mut tick = tokio::time::interval(poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    command = rx.recv() => {
                        match command {
                            Some(Command::Submit { member, operation_id, request }) => {
                                request.begin(member, operation_id, &mut state);
                            }
                            Some(Command::Receive { member, log_id, response }) => {
                                state.receive(member, log_id, response);
                            }
                            Some(Command::Join(node)) => {
                                tracing::info!(database = %state.database, node = %node, "member joined");
                                state.members.insert(node);
                            }
                            Some(Command::Leave(node)) => {
                                tracing::info!(database = %state.database, node = %node, "member left");
                                state.members.remove(&node);
                            }
                            Some(Command::Log { request, reply }) => {
                                let _ = reply.send(state.log.append(request));
                            }
                            Some(Command::LastLog { reply }) => {
                                let _ = reply.send(state.last_persistent_log());
                            }
                            Some(Command::ActiveContexts { reply }) => {
                                let _ = reply.send(state.contexts.len());
                            }
                            Some(Command::Close { done }) => {
                                state.abandon_all();
                                let _ = done.send(());
                                break;
                            }
                            None => break,
                        }
                    }
                    _ = tick.tick() => state.tick(),
                }
            }
        });

        Self {
            database,
            commands,
            worker: Mutex::new(Some(worker)),
            drain_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Enqueue a client submission. The request's `begin` runs on the
    /// worker and decides whether a replicated operation is dispatched.
    pub fn submit(
        &self,
        member: NodeId,
        operation_id: OperationId,
        request: SubmitRequest,
    ) -> Result<()> {
        self.send(Command::Submit {
            member,
            operation_id,
            request,
        })
    }

    /// Deliver a member's response for an in-flight request. Unknown or
    /// stale log ids are ignored.
    pub fn receive(&self, member: NodeId, log_id: LogId, response: NodeResponse) -> Result<()> {
        self.send(Command::Receive {
            member,
            log_id,
            response,
        })
    }

    pub fn join(&self, node: NodeId) -> Result<()> {
        self.send(Command::Join(node))
    }

    pub fn leave(&self, node: NodeId) -> Result<()> {
        self.send(Command::Leave(node))
    }

    /// Append a request to the operation log without dispatching it.
    /// Exposed for collaborators that replicate through other channels.
    pub async fn log(&self, request: NodeRequest) -> Result<LogId> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Log { request, reply: tx })?;
        rx.await
            .map_err(|_| Error::Closed(self.database.clone()))?
    }

    /// Most recent log position, or `None` when the log is empty.
    pub async fn last_persistent_log(&self) -> Result<Option<LogId>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::LastLog { reply: tx })?;
        rx.await.map_err(|_| Error::Closed(self.database.clone()))
    }

    /// Number of in-flight request contexts.
    pub async fn active_contexts(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ActiveContexts { reply: tx })?;
        rx.await.map_err(|_| Error::Closed(self.database.clone()))
    }

    /// Stop accepting submissions and drain the worker within the
    /// configured bound. Work still in flight past the deadline is
    /// abandoned, not cancelled; shutdown is best effort, not atomic.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close { done: tx }).is_ok()
            && tokio::time::timeout(self.drain_timeout, rx).await.is_err()
        {
            tracing::warn!(
                database = %self.database,
                "drain deadline passed, abandoning remaining work"
            );
        }

        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed(self.database.clone()));
        }
        self.commands
            .send(command)
            .map_err(|_| Error::Closed(self.database.clone()))
    }
}
