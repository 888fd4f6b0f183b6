use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use weft_core::{
    ChatModel, ChatRequest, ChatResponse, ErrorKind, Message, Tool, ToolCall, WeftError,
};
use weft_graph::{
    Checkpoint, CheckpointConfig, CheckpointSource, Checkpointer, EngineConfig, GraphEngine,
    MemorySaver, NodeId, ToolErrorPolicy,
};
use weft_models::{ReplayChatModel, ScriptedChatModel};
use weft_tools::ToolRegistry;

struct MarkPriceTool {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for MarkPriceTool {
    fn name(&self) -> &str {
        "get_mark_price"
    }
    fn description(&self) -> &str {
        "Mark price of a perpetual"
    }
    async fn call(&self, _args: Value) -> Result<Value, WeftError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!("67000"))
    }
}

struct NoopTool;

#[async_trait]
impl Tool for NoopTool {
    fn name(&self) -> &str {
        "noop"
    }
    fn description(&self) -> &str {
        "Does nothing"
    }
    async fn call(&self, _args: Value) -> Result<Value, WeftError> {
        Ok(Value::Null)
    }
}

/// Always asks for the noop tool.
struct LoopingModel {
    calls: AtomicUsize,
}

#[async_trait]
impl ChatModel for LoopingModel {
    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, WeftError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ChatResponse::new(Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new(format!("call-{n}"), "noop", json!({}))],
        )))
    }
}

/// Answers "ok" after `delay`.
struct SlowModel {
    delay: Duration,
}

#[async_trait]
impl ChatModel for SlowModel {
    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, WeftError> {
        tokio::time::sleep(self.delay).await;
        Ok(ChatResponse::new(Message::assistant("ok")))
    }
}

/// Rejects every write.
struct BrokenStore;

#[async_trait]
impl Checkpointer for BrokenStore {
    async fn put(&self, _: &CheckpointConfig, _: &Checkpoint) -> Result<(), WeftError> {
        Err(WeftError::Storage("disk full".to_string()))
    }
    async fn get(&self, _: &CheckpointConfig) -> Result<Option<Checkpoint>, WeftError> {
        Ok(None)
    }
    async fn list(&self, _: &CheckpointConfig) -> Result<Vec<Checkpoint>, WeftError> {
        Ok(vec![])
    }
    async fn delete(&self, _: &CheckpointConfig) -> Result<(), WeftError> {
        Ok(())
    }
}

fn price_call() -> Message {
    Message::assistant_with_tool_calls(
        "",
        vec![ToolCall::new(
            "call-1",
            "get_mark_price",
            json!({"coin": "BTC"}),
        )],
    )
}

fn answer() -> Message {
    Message::assistant("BTC is trading at 67000")
}

fn price_registry(calls: Arc<AtomicUsize>) -> ToolRegistry {
    ToolRegistry::new([Arc::new(MarkPriceTool { calls }) as Arc<dyn Tool>]).unwrap()
}

fn engine(
    model: Arc<dyn ChatModel>,
    saver: Arc<dyn Checkpointer>,
    config: EngineConfig,
) -> GraphEngine {
    GraphEngine::builder()
        .model(model)
        .tools(price_registry(Arc::new(AtomicUsize::new(0))))
        .checkpointer(saver)
        .config(config)
        .build()
        .unwrap()
}

#[tokio::test]
async fn mark_price_conversation_reaches_end() {
    let model = ScriptedChatModel::from_messages(vec![price_call(), answer()]);
    let saver = Arc::new(MemorySaver::new());
    let tool_calls = Arc::new(AtomicUsize::new(0));
    let engine = GraphEngine::builder()
        .model(Arc::new(model.clone()))
        .tools(price_registry(tool_calls.clone()))
        .checkpointer(saver.clone())
        .config(EngineConfig::default().with_system_prompt("You are a trading assistant."))
        .build()
        .unwrap();

    let state = engine
        .run("thread-1", "What is the mark price of BTC?")
        .await
        .unwrap();

    assert_eq!(
        state.messages,
        vec![
            Message::user("What is the mark price of BTC?"),
            price_call(),
            Message::tool("67000", "call-1"),
            answer(),
        ]
    );
    assert_eq!(tool_calls.load(Ordering::SeqCst), 1);

    // the system prompt reaches the model but never the transcript
    let requests = model.requests().await;
    assert_eq!(requests.len(), 2);
    assert!(requests[0].messages[0].is_system());
    assert_eq!(requests[1].messages.len(), 4);
    assert!(state.messages.iter().all(|m| !m.is_system()));
    assert_eq!(requests[0].tools[0].name, "get_mark_price");
}

#[tokio::test]
async fn checkpoint_is_written_after_every_node() {
    let model = ScriptedChatModel::from_messages(vec![price_call(), answer()]);
    let saver = Arc::new(MemorySaver::new());
    let engine = engine(Arc::new(model), saver.clone(), EngineConfig::default());

    engine.run("t", "price?").await.unwrap();

    let history = engine.get_state_history("t").await.unwrap();
    let trail: Vec<(CheckpointSource, Option<NodeId>, usize)> = history
        .iter()
        .map(|cp| (cp.source, cp.next, cp.state.len()))
        .collect();
    assert_eq!(
        trail,
        vec![
            (CheckpointSource::Input, Some(NodeId::Agent), 1),
            (CheckpointSource::Agent, Some(NodeId::Tools), 2),
            (CheckpointSource::Tools, Some(NodeId::Agent), 3),
            (CheckpointSource::Agent, None, 4),
        ]
    );
    let steps: Vec<u64> = history.iter().map(|cp| cp.step).collect();
    assert_eq!(steps, vec![1, 2, 3, 4]);

    let latest = engine.get_state("t").await.unwrap().unwrap();
    assert_eq!(latest.last_message(), Some(&answer()));
}

#[tokio::test]
async fn step_budget_stops_a_looping_model() {
    let model = Arc::new(LoopingModel {
        calls: AtomicUsize::new(0),
    });
    let registry = ToolRegistry::new([Arc::new(NoopTool) as Arc<dyn Tool>]).unwrap();
    let engine = GraphEngine::builder()
        .model(model.clone())
        .tools(registry)
        .checkpointer(Arc::new(MemorySaver::new()))
        .config(EngineConfig::default().with_max_round_trips(3))
        .build()
        .unwrap();

    let err = engine.run("loop", "go").await.unwrap_err();

    assert!(matches!(
        err,
        WeftError::StepBudgetExceeded { max_round_trips: 3 }
    ));
    assert_eq!(err.kind(), ErrorKind::StepBudgetExceeded);
    // three round-trips plus the agent turn that asked for a fourth
    assert_eq!(model.calls.load(Ordering::SeqCst), 4);

    let stored = engine.get_state("loop").await.unwrap().unwrap();
    let tool_messages = stored.messages.iter().filter(|m| m.is_tool()).count();
    assert_eq!(tool_messages, 3);
}

#[tokio::test]
async fn zero_budget_forbids_any_tool_dispatch() {
    let model = ScriptedChatModel::from_messages(vec![price_call()]);
    let engine = engine(
        Arc::new(model),
        Arc::new(MemorySaver::new()),
        EngineConfig::default().with_max_round_trips(0),
    );

    let err = engine.run("t", "price?").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StepBudgetExceeded);
}

#[tokio::test]
async fn thread_takes_a_new_turn_after_budget_failure() {
    let engine = engine(
        Arc::new(ScriptedChatModel::from_messages(vec![
            price_call(),
            Message::assistant("hello again"),
        ])),
        Arc::new(MemorySaver::new()),
        EngineConfig::default().with_max_round_trips(0),
    );

    let err = engine.run("t", "price?").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StepBudgetExceeded);

    let closed = engine.get_state_history("t").await.unwrap();
    let last = closed.last().unwrap();
    assert_eq!(last.next, None);
    assert_eq!(last.state.messages.len(), 2);

    // Nothing is pending, so resume is a no-op rather than another failure.
    assert_eq!(engine.resume("t").await.unwrap(), last.state);

    let state = engine.run("t", "hi").await.unwrap();
    let roles: Vec<&str> = state.messages.iter().map(|m| m.role().as_str()).collect();
    assert_eq!(roles, vec!["user", "assistant", "user", "assistant"]);
    assert_eq!(state.last_message().unwrap().content(), "hello again");
}

#[tokio::test]
async fn budget_resets_each_turn() {
    let engine = engine(
        Arc::new(ScriptedChatModel::from_messages(vec![
            price_call(),
            answer(),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("call-2", "get_mark_price", json!({"coin": "BTC"}))],
            ),
            answer(),
        ])),
        Arc::new(MemorySaver::new()),
        EngineConfig::default().with_max_round_trips(1),
    );

    engine.run("t", "first").await.unwrap();
    let state = engine.run("t", "second").await.unwrap();
    assert_eq!(state.messages.len(), 8);
}

/// Forwards writes up to `last_step`, then fails every write, like a process
/// killed right after that checkpoint.
struct KilledAfter {
    inner: Arc<MemorySaver>,
    last_step: u64,
}

#[async_trait]
impl Checkpointer for KilledAfter {
    async fn put(&self, config: &CheckpointConfig, cp: &Checkpoint) -> Result<(), WeftError> {
        if cp.step > self.last_step {
            return Err(WeftError::Storage("process killed".to_string()));
        }
        self.inner.put(config, cp).await
    }
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>, WeftError> {
        self.inner.get(config).await
    }
    async fn list(&self, config: &CheckpointConfig) -> Result<Vec<Checkpoint>, WeftError> {
        self.inner.list(config).await
    }
    async fn delete(&self, config: &CheckpointConfig) -> Result<(), WeftError> {
        self.inner.delete(config).await
    }
}

fn price_script() -> ReplayChatModel {
    ReplayChatModel::new(vec![price_call(), answer()])
}

#[tokio::test]
async fn resumed_thread_matches_uninterrupted_run() {
    let reference = engine(
        Arc::new(price_script()),
        Arc::new(MemorySaver::new()),
        EngineConfig::default(),
    )
    .run("t", "What is the mark price of BTC?")
    .await
    .unwrap();

    // First process: checkpoints 1 (input), 2 (agent) and 3 (tools) land,
    // then the process dies before the second agent step is persisted.
    let saver = Arc::new(MemorySaver::new());
    let killed = engine(
        Arc::new(price_script()),
        Arc::new(KilledAfter {
            inner: saver.clone(),
            last_step: 3,
        }),
        EngineConfig::default(),
    );
    let err = killed
        .run("t", "What is the mark price of BTC?")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    drop(killed);

    let last = saver
        .get(&CheckpointConfig::new("t"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.source, CheckpointSource::Tools);
    assert_eq!(last.next, Some(NodeId::Agent));

    // Second process: same store, same script, fresh engine.
    let restarted = engine(Arc::new(price_script()), saver.clone(), EngineConfig::default());
    let resumed = restarted.resume("t").await.unwrap();

    assert_eq!(resumed, reference);
}

#[tokio::test]
async fn pending_thread_rejects_new_turn() {
    let saver = Arc::new(MemorySaver::new());
    let crashed = engine(
        Arc::new(ScriptedChatModel::new(vec![])),
        saver.clone(),
        EngineConfig::default(),
    );
    crashed.run("t", "first").await.unwrap_err();

    let err = crashed.run("t", "second").await.unwrap_err();
    assert!(matches!(err, WeftError::Graph(msg) if msg.contains("pending")));
}

#[tokio::test]
async fn resume_of_finished_thread_is_a_no_op() {
    let engine = engine(
        Arc::new(ScriptedChatModel::from_messages(vec![answer()])),
        Arc::new(MemorySaver::new()),
        EngineConfig::default(),
    );
    let done = engine.run("t", "hi").await.unwrap();
    assert_eq!(engine.resume("t").await.unwrap(), done);
}

#[tokio::test]
async fn resume_without_checkpoint_fails() {
    let engine = engine(
        Arc::new(ScriptedChatModel::new(vec![])),
        Arc::new(MemorySaver::new()),
        EngineConfig::default(),
    );
    let err = engine.resume("missing").await.unwrap_err();
    assert!(matches!(err, WeftError::Graph(msg) if msg.contains("missing")));
}

#[tokio::test]
async fn second_turn_continues_the_transcript() {
    let model = ScriptedChatModel::from_messages(vec![
        Message::assistant("hello"),
        Message::assistant("still here"),
    ]);
    let engine = engine(
        Arc::new(model.clone()),
        Arc::new(MemorySaver::new()),
        EngineConfig::default(),
    );

    engine.run("t", "hi").await.unwrap();
    let state = engine.run("t", "you there?").await.unwrap();

    let contents: Vec<&str> = state.messages.iter().map(|m| m.content()).collect();
    assert_eq!(contents, vec!["hi", "hello", "you there?", "still here"]);
    assert_eq!(model.requests().await[1].messages.len(), 3);
}

#[tokio::test]
async fn storage_failure_is_fatal() {
    let engine = engine(
        Arc::new(ScriptedChatModel::from_messages(vec![answer()])),
        Arc::new(BrokenStore),
        EngineConfig::default(),
    );
    let err = engine.run("t", "hi").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
}

#[tokio::test]
async fn abort_policy_surfaces_tool_errors() {
    let model = ScriptedChatModel::from_messages(vec![Message::assistant_with_tool_calls(
        "",
        vec![ToolCall::new("c1", "missing_tool", json!({}))],
    )]);
    let engine = engine(
        Arc::new(model),
        Arc::new(MemorySaver::new()),
        EngineConfig::default().with_tool_error_policy(ToolErrorPolicy::Abort),
    );

    let err = engine.run("t", "go").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolInvocation);
}

#[tokio::test]
async fn report_policy_lets_model_see_unknown_tool() {
    let model = ScriptedChatModel::from_messages(vec![
        Message::assistant_with_tool_calls("", vec![ToolCall::new("c1", "missing_tool", json!({}))]),
        Message::assistant("sorry, I cannot do that"),
    ]);
    let engine = engine(
        Arc::new(model.clone()),
        Arc::new(MemorySaver::new()),
        EngineConfig::default(),
    );

    let state = engine.run("t", "go").await.unwrap();
    assert!(state.messages[2].is_error());
    assert_eq!(state.messages[2].tool_call_id(), Some("c1"));
    assert_eq!(state.last_message().unwrap().content(), "sorry, I cannot do that");
}

#[tokio::test]
async fn cancellation_keeps_last_checkpoint() {
    let saver = Arc::new(MemorySaver::new());
    let slow = engine(
        Arc::new(SlowModel {
            delay: Duration::from_secs(10),
        }),
        saver.clone(),
        EngineConfig::default(),
    );

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let err = slow.run_with_cancel("t", "hi", &token).await.unwrap_err();
    assert!(matches!(err, WeftError::Cancelled));

    let last = saver
        .get(&CheckpointConfig::new("t"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.source, CheckpointSource::Input);
    assert_eq!(last.state.messages, vec![Message::user("hi")]);

    let fast = engine(
        Arc::new(SlowModel {
            delay: Duration::from_millis(0),
        }),
        saver,
        EngineConfig::default(),
    );
    let state = fast.resume("t").await.unwrap();
    assert_eq!(state.messages, vec![Message::user("hi"), Message::assistant("ok")]);
}

#[tokio::test]
async fn already_cancelled_token_runs_nothing() {
    let model = ScriptedChatModel::from_messages(vec![answer()]);
    let engine = engine(
        Arc::new(model.clone()),
        Arc::new(MemorySaver::new()),
        EngineConfig::default(),
    );
    let token = CancellationToken::new();
    token.cancel();

    let err = engine.run_with_cancel("t", "hi", &token).await.unwrap_err();
    assert!(matches!(err, WeftError::Cancelled));
    assert_eq!(model.remaining().await, 1);
}

#[tokio::test]
async fn model_timeout_fails_the_step() {
    let engine = engine(
        Arc::new(SlowModel {
            delay: Duration::from_secs(10),
        }),
        Arc::new(MemorySaver::new()),
        EngineConfig::default().with_model_timeout(Duration::from_millis(20)),
    );
    let err = engine.run("t", "hi").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModelInvocation);
}

#[tokio::test]
async fn threads_run_independently() {
    let engine = Arc::new(engine(
        Arc::new(SlowModel {
            delay: Duration::from_millis(20),
        }),
        Arc::new(MemorySaver::new()),
        EngineConfig::default(),
    ));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run(&format!("thread-{i}"), format!("hi {i}")).await })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let state = handle.await.unwrap().unwrap();
        assert_eq!(state.messages[0].content(), format!("hi {i}"));
        assert_eq!(state.len(), 2);
    }
}

#[tokio::test]
async fn same_thread_turns_are_serialized() {
    let engine = Arc::new(engine(
        Arc::new(SlowModel {
            delay: Duration::from_millis(20),
        }),
        Arc::new(MemorySaver::new()),
        EngineConfig::default(),
    ));

    let a = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run("shared", "first").await })
    };
    let b = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run("shared", "second").await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let state = engine.get_state("shared").await.unwrap().unwrap();
    let roles: Vec<&str> = state.messages.iter().map(|m| m.role().as_str()).collect();
    assert_eq!(roles, vec!["user", "assistant", "user", "assistant"]);
}

#[tokio::test]
async fn stream_yields_an_event_per_node() {
    let engine = engine(
        Arc::new(ScriptedChatModel::from_messages(vec![price_call(), answer()])),
        Arc::new(MemorySaver::new()),
        EngineConfig::default(),
    );

    let events: Vec<_> = engine.stream("t", "price?").collect().await;
    let events: Vec<_> = events.into_iter().map(|e| e.unwrap()).collect();

    let nodes: Vec<NodeId> = events.iter().map(|e| e.node).collect();
    assert_eq!(nodes, vec![NodeId::Agent, NodeId::Tools, NodeId::Agent]);
    assert_eq!(events[1].delta, vec![Message::tool("67000", "call-1")]);
    assert_eq!(events[2].next, None);
    assert_eq!(events[2].state.len(), 4);
}

#[tokio::test]
async fn stream_ends_with_the_error() {
    let engine = engine(
        Arc::new(ScriptedChatModel::from_messages(vec![price_call()])),
        Arc::new(MemorySaver::new()),
        EngineConfig::default(),
    );

    let items: Vec<_> = engine.stream("t", "price?").collect().await;
    assert_eq!(items.len(), 3);
    assert!(items[0].is_ok());
    assert!(items[1].is_ok());
    assert_eq!(
        items[2].as_ref().unwrap_err().kind(),
        ErrorKind::ModelInvocation
    );
}

#[tokio::test]
async fn evict_forgets_the_thread() {
    let engine = engine(
        Arc::new(ScriptedChatModel::from_messages(vec![answer()])),
        Arc::new(MemorySaver::new()),
        EngineConfig::default(),
    );
    engine.run("t", "hi").await.unwrap();
    engine.evict("t").await.unwrap();
    assert!(engine.get_state("t").await.unwrap().is_none());
}

#[tokio::test]
async fn corrupted_checkpoint_is_refused() {
    let saver = Arc::new(MemorySaver::new());
    saver
        .put(
            &CheckpointConfig::new("t"),
            &Checkpoint {
                step: 1,
                source: CheckpointSource::Tools,
                state: weft_graph::MessageState::with_messages(vec![Message::tool(
                    "67000", "ghost",
                )]),
                next: Some(NodeId::Agent),
                round_trips: 1,
            },
        )
        .await
        .unwrap();
    let engine = engine(
        Arc::new(ScriptedChatModel::from_messages(vec![answer()])),
        saver,
        EngineConfig::default(),
    );

    let err = engine.resume("t").await.unwrap_err();
    assert!(matches!(err, WeftError::Graph(msg) if msg.contains("ghost")));
}

#[test]
fn builder_requires_model_and_checkpointer() {
    let err = GraphEngine::builder()
        .checkpointer(Arc::new(MemorySaver::new()))
        .build()
        .unwrap_err();
    assert!(matches!(err, WeftError::Config(_)));

    let err = GraphEngine::builder()
        .model(Arc::new(ScriptedChatModel::new(vec![])))
        .build()
        .unwrap_err();
    assert!(matches!(err, WeftError::Config(_)));
}
