use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::Stream;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use weft_core::{ChatModel, Message, WeftError};
use weft_tools::{ParallelToolExecutor, ToolRegistry};

use crate::agent_node::AgentNode;
use crate::checkpoint::{Checkpoint, CheckpointConfig, CheckpointSource, Checkpointer};
use crate::config::EngineConfig;
use crate::node::{Node, NodeId};
use crate::router::{route_after, transition, Target, ENTRY};
use crate::state::MessageState;
use crate::tool_node::ToolNode;

/// Emitted after every node while streaming a run.
#[derive(Debug, Clone)]
pub struct GraphEvent {
    pub thread_id: String,
    pub step: u64,
    /// The node that just executed.
    pub node: NodeId,
    /// What the node appended.
    pub delta: Vec<Message>,
    /// The full state after the delta was reduced.
    pub state: MessageState,
    /// The node that will run next, `None` at the end.
    pub next: Option<NodeId>,
}

/// A stream of graph events.
pub type GraphStream<'a> = Pin<Box<dyn Stream<Item = Result<GraphEvent, WeftError>> + Send + 'a>>;

/// Where a thread's loop picks up.
struct Cursor {
    state: MessageState,
    next: Target,
    step: u64,
    round_trips: usize,
}

/// Drives the agent/tools loop for any number of independent threads.
///
/// Within one thread nodes run strictly one after another and calls on the
/// same thread id are serialized; different threads never wait on each other.
pub struct GraphEngine {
    agent: Box<dyn Node>,
    tools: Box<dyn Node>,
    checkpointer: Arc<dyn Checkpointer>,
    config: EngineConfig,
    thread_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for GraphEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphEngine")
            .field("entry", &ENTRY)
            .field("config", &self.config)
            .finish()
    }
}

impl GraphEngine {
    pub fn new(
        agent: impl Node + 'static,
        tools: impl Node + 'static,
        checkpointer: Arc<dyn Checkpointer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            agent: Box::new(agent),
            tools: Box::new(tools),
            checkpointer,
            config,
            thread_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn builder() -> GraphEngineBuilder {
        GraphEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn node(&self, id: NodeId) -> &dyn Node {
        match id {
            NodeId::Agent => self.agent.as_ref(),
            NodeId::Tools => self.tools.as_ref(),
        }
    }

    /// Start a new turn on `thread_id` with a user message and run it to the end.
    ///
    /// The thread's stored transcript (if any) is restored first. A thread
    /// whose last checkpoint still has a pending node is rejected; use
    /// [`GraphEngine::resume`] for it.
    pub async fn run(
        &self,
        thread_id: &str,
        user_message: impl Into<String>,
    ) -> Result<MessageState, WeftError> {
        self.execute(thread_id, Some(Message::user(user_message)), None, None)
            .await
    }

    /// Continue a thread from its last checkpoint, e.g. after a crash.
    ///
    /// A thread that already ended is returned unchanged.
    pub async fn resume(&self, thread_id: &str) -> Result<MessageState, WeftError> {
        self.execute(thread_id, None, None, None).await
    }

    /// [`GraphEngine::run`], abandoning the in-flight node when `cancel` fires.
    ///
    /// The abandoned node's delta is discarded, so the thread keeps its last
    /// persisted checkpoint and can be resumed.
    pub async fn run_with_cancel(
        &self,
        thread_id: &str,
        user_message: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<MessageState, WeftError> {
        self.execute(
            thread_id,
            Some(Message::user(user_message)),
            Some(cancel),
            None,
        )
        .await
    }

    pub async fn resume_with_cancel(
        &self,
        thread_id: &str,
        cancel: &CancellationToken,
    ) -> Result<MessageState, WeftError> {
        self.execute(thread_id, None, Some(cancel), None).await
    }

    /// Run a turn, yielding a [`GraphEvent`] after every node.
    ///
    /// A fatal error is yielded as the last item.
    pub fn stream(&self, thread_id: &str, user_message: impl Into<String>) -> GraphStream<'_> {
        let thread_id = thread_id.to_string();
        let input = Message::user(user_message);

        enum Progress {
            Event(GraphEvent),
            Done(Result<MessageState, WeftError>),
        }

        Box::pin(async_stream::stream! {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let run = self.execute(&thread_id, Some(input), None, Some(&tx));
            tokio::pin!(run);

            loop {
                let progress = tokio::select! {
                    biased;
                    Some(event) = rx.recv() => Progress::Event(event),
                    result = &mut run => Progress::Done(result),
                };
                match progress {
                    Progress::Event(event) => yield Ok(event),
                    Progress::Done(result) => {
                        while let Ok(event) = rx.try_recv() {
                            yield Ok(event);
                        }
                        if let Err(e) = result {
                            yield Err(e);
                        }
                        break;
                    }
                }
            }
        })
    }

    /// The thread's current transcript, if it has been checkpointed.
    pub async fn get_state(&self, thread_id: &str) -> Result<Option<MessageState>, WeftError> {
        let config = CheckpointConfig::new(thread_id);
        Ok(self.checkpointer.get(&config).await?.map(|cp| cp.state))
    }

    /// Every checkpoint of the thread, oldest first.
    pub async fn get_state_history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, WeftError> {
        self.checkpointer
            .list(&CheckpointConfig::new(thread_id))
            .await
    }

    /// Forget a thread entirely.
    pub async fn evict(&self, thread_id: &str) -> Result<(), WeftError> {
        let guard = self.lock_thread(thread_id).await;
        let result = self
            .checkpointer
            .delete(&CheckpointConfig::new(thread_id))
            .await;
        drop(guard);
        self.prune_locks().await;
        tracing::info!(thread_id = %thread_id, "thread evicted");
        result
    }

    async fn lock_thread(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.thread_locks.lock().await;
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn prune_locks(&self) {
        self.thread_locks
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    async fn execute(
        &self,
        thread_id: &str,
        input: Option<Message>,
        cancel: Option<&CancellationToken>,
        events: Option<&mpsc::UnboundedSender<GraphEvent>>,
    ) -> Result<MessageState, WeftError> {
        let guard = self.lock_thread(thread_id).await;
        let config = CheckpointConfig::new(thread_id);

        let result = match self.start(&config, input).await {
            Ok(cursor) => self.drive(&config, cursor, cancel, events).await,
            Err(e) => Err(e),
        };

        drop(guard);
        self.prune_locks().await;

        if let Err(ref e) = result {
            tracing::error!(thread_id = %thread_id, kind = %e.kind(), error = %e, "run failed");
        }
        result
    }

    /// Restore the thread and decide where the loop starts.
    async fn start(
        &self,
        config: &CheckpointConfig,
        input: Option<Message>,
    ) -> Result<Cursor, WeftError> {
        let previous = self.checkpointer.get(config).await?;
        if let Some(ref cp) = previous {
            cp.state.validate()?;
        }

        match input {
            Some(message) => {
                if let Some(ref cp) = previous {
                    if let Some(pending) = cp.next {
                        return Err(WeftError::Graph(format!(
                            "thread '{}' has a pending '{pending}' step; resume it first",
                            config.thread_id
                        )));
                    }
                }
                let (state, step) = previous
                    .map(|cp| (cp.state, cp.step))
                    .unwrap_or_default();
                let state = state.reduce(vec![message]);
                let step = step + 1;

                self.checkpointer
                    .put(
                        config,
                        &Checkpoint {
                            step,
                            source: CheckpointSource::Input,
                            state: state.clone(),
                            next: Some(ENTRY),
                            round_trips: 0,
                        },
                    )
                    .await?;
                tracing::info!(thread_id = %config.thread_id, step, "turn started");

                Ok(Cursor {
                    state,
                    next: Target::Node(ENTRY),
                    step,
                    round_trips: 0,
                })
            }
            None => {
                let cp = previous.ok_or_else(|| {
                    WeftError::Graph(format!(
                        "no checkpoint for thread '{}'",
                        config.thread_id
                    ))
                })?;
                tracing::info!(
                    thread_id = %config.thread_id,
                    step = cp.step,
                    next = ?cp.next,
                    "resuming thread"
                );
                Ok(Cursor {
                    state: cp.state,
                    next: Target::from(cp.next),
                    step: cp.step,
                    round_trips: cp.round_trips,
                })
            }
        }
    }

    async fn drive(
        &self,
        config: &CheckpointConfig,
        cursor: Cursor,
        cancel: Option<&CancellationToken>,
        events: Option<&mpsc::UnboundedSender<GraphEvent>>,
    ) -> Result<MessageState, WeftError> {
        let Cursor {
            mut state,
            mut next,
            mut step,
            mut round_trips,
        } = cursor;

        while let Target::Node(node_id) = next {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                return Err(WeftError::Cancelled);
            }
            if node_id == NodeId::Tools && round_trips >= self.config.max_round_trips {
                self.close_turn(config, &state, step, round_trips).await?;
                return Err(WeftError::StepBudgetExceeded {
                    max_round_trips: self.config.max_round_trips,
                });
            }

            let started = Instant::now();
            let delta = self.run_node(node_id, &state, cancel).await?;
            let delta_len = delta.len();
            state.merge(delta.clone());

            let route = route_after(node_id, &state);
            let target = transition(node_id, route).ok_or_else(|| {
                WeftError::Graph(format!("no edge from '{node_id}' for {route:?}"))
            })?;
            if node_id == NodeId::Tools {
                round_trips += 1;
            }
            step += 1;

            self.checkpointer
                .put(
                    config,
                    &Checkpoint {
                        step,
                        source: node_id.into(),
                        state: state.clone(),
                        next: target.node(),
                        round_trips,
                    },
                )
                .await?;

            tracing::info!(
                thread_id = %config.thread_id,
                node = %node_id,
                step,
                delta_len,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "node finished"
            );
            tracing::debug!(thread_id = %config.thread_id, route = ?route, target = ?target, "routed");

            if let Some(tx) = events {
                // The receiver only goes away when the stream is dropped.
                let _ = tx.send(GraphEvent {
                    thread_id: config.thread_id.clone(),
                    step,
                    node: node_id,
                    delta,
                    state: state.clone(),
                    next: target.node(),
                });
            }

            next = target;
        }

        tracing::info!(
            thread_id = %config.thread_id,
            step,
            round_trips,
            messages = state.len(),
            "turn finished"
        );
        Ok(state)
    }

    /// End the turn without dispatching the pending tool calls, so the
    /// thread accepts a new user message afterwards.
    async fn close_turn(
        &self,
        config: &CheckpointConfig,
        state: &MessageState,
        step: u64,
        round_trips: usize,
    ) -> Result<(), WeftError> {
        self.checkpointer
            .put(
                config,
                &Checkpoint {
                    step: step + 1,
                    source: CheckpointSource::Agent,
                    state: state.clone(),
                    next: None,
                    round_trips,
                },
            )
            .await?;
        tracing::warn!(
            thread_id = %config.thread_id,
            round_trips,
            max_round_trips = self.config.max_round_trips,
            "step budget exhausted, turn closed"
        );
        Ok(())
    }

    async fn run_node(
        &self,
        node_id: NodeId,
        state: &MessageState,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Message>, WeftError> {
        let work = self.node(node_id).process(state);
        match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::warn!(node = %node_id, "node cancelled, discarding its output");
                    Err(WeftError::Cancelled)
                }
                result = work => result,
            },
            None => work.await,
        }
    }

    /// Render the graph as a Mermaid flowchart string.
    pub fn draw_mermaid(&self) -> String {
        crate::visualization::draw_mermaid()
    }

    /// Render the graph as a simple ASCII text summary.
    pub fn draw_ascii(&self) -> String {
        crate::visualization::draw_ascii()
    }
}

/// Assembles a [`GraphEngine`] from a model, a tool registry and a checkpointer.
#[derive(Default)]
pub struct GraphEngineBuilder {
    model: Option<Arc<dyn ChatModel>>,
    agent: Option<Box<dyn Node>>,
    tools: Option<ToolRegistry>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    config: EngineConfig,
}

impl GraphEngineBuilder {
    pub fn model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Replace the model-backed agent node with a custom one.
    pub fn agent_node(mut self, node: impl Node + 'static) -> Self {
        self.agent = Some(Box::new(node));
        self
    }

    pub fn tools(mut self, registry: ToolRegistry) -> Self {
        self.tools = Some(registry);
        self
    }

    pub fn checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<GraphEngine, WeftError> {
        let registry = self.tools.unwrap_or_default();
        let checkpointer = self
            .checkpointer
            .ok_or_else(|| WeftError::Config("no checkpointer configured".to_string()))?;

        let agent: Box<dyn Node> = match (self.agent, self.model) {
            (Some(node), _) => node,
            (None, Some(model)) => {
                let mut node = AgentNode::new(model, registry.catalog())
                    .with_timeout(self.config.model_timeout);
                if let Some(ref prompt) = self.config.system_prompt {
                    node = node.with_system_prompt(prompt.clone());
                }
                Box::new(node)
            }
            (None, None) => {
                return Err(WeftError::Config(
                    "no model or agent node configured".to_string(),
                ))
            }
        };

        let executor = ParallelToolExecutor::new(registry)
            .with_max_concurrency(self.config.max_tool_concurrency)
            .with_timeout(self.config.tool_timeout);
        let tools = ToolNode::new(executor).with_policy(self.config.tool_error_policy);

        Ok(GraphEngine {
            agent,
            tools: Box::new(tools),
            checkpointer,
            config: self.config,
            thread_locks: Mutex::new(HashMap::new()),
        })
    }
}
