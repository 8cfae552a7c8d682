use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use palaver_chat::{
    ChatSession, Identity, InvocationState, MessageStatus, QuotaTracker, SessionConfig,
    SessionEvent, SessionStatus, SubmitError,
};
use palaver_llm::{ChatClient, ChatOptions, ChatRequest, EventStream, Message, StreamEvent};
use palaver_persist::{
    InMemoryStore, Project, StoredMessage, StoredMessageStatus, StoredToolCall, Thread,
    ThreadQuery, ThreadStore, Visibility,
};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Notify};

type Feed = mpsc::UnboundedSender<anyhow::Result<StreamEvent>>;

/// Provider whose streams are fed by the test through channels
#[derive(Default)]
struct ScriptedClient {
    streams: Mutex<VecDeque<mpsc::UnboundedReceiver<anyhow::Result<StreamEvent>>>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedClient {
    fn script(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> ChatRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn chat_stream(&self, request: ChatRequest) -> anyhow::Result<EventStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let mut rx = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted stream"))?;
        Ok(Box::pin(async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        }))
    }
}

struct Harness {
    client: Arc<ScriptedClient>,
    store: Arc<InMemoryStore>,
    session: ChatSession,
}

fn harness(identity: Identity, quota: Option<Arc<QuotaTracker>>) -> Harness {
    let client = Arc::new(ScriptedClient::default());
    let store = Arc::new(InMemoryStore::new());
    let mut builder = ChatSession::builder()
        .thread_id("thread-1")
        .identity(identity)
        .client(client.clone())
        .store(store.clone())
        .config(
            SessionConfig::new("test-model")
                .with_api_key("sk-user")
                .with_system_prompt("You are terse.")
                .with_options(ChatOptions::new().temperature(0.2))
                .with_render_throttle_ms(10),
        );
    if let Some(quota) = quota {
        builder = builder.quota(quota);
    }
    Harness {
        client,
        store,
        session: builder.build().unwrap(),
    }
}

fn user_harness() -> Harness {
    harness(Identity::User("alice".into()), None)
}

async fn wait_for<F>(events: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

fn is_invalidated(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Invalidated { .. })
}

#[tokio::test]
async fn test_tokens_concatenate_in_order() {
    let h = user_harness();
    let feed = h.client.script();
    for token in ["Hel", "lo, ", "world"] {
        feed.send(Ok(StreamEvent::message(token))).unwrap();
    }
    feed.send(Ok(StreamEvent::done())).unwrap();

    h.session.submit("greet me").await.unwrap();
    h.session.join().await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Idle);
    assert_eq!(snapshot.last_assistant_text(), Some("Hello, world"));
    assert_eq!(snapshot.transcript[1].status, MessageStatus::Done);
}

#[tokio::test]
async fn test_watch_publishes_final_snapshot() {
    let h = user_harness();
    let mut watch = h.session.watch();
    let feed = h.client.script();

    h.session.submit("hi").await.unwrap();
    feed.send(Ok(StreamEvent::message("hey"))).unwrap();
    feed.send(Ok(StreamEvent::done())).unwrap();

    let snapshot = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            watch.changed().await.unwrap();
            let snapshot = watch.borrow_and_update().clone();
            if snapshot.status == SessionStatus::Idle && snapshot.transcript.len() == 2 {
                return snapshot;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(snapshot.last_assistant_text(), Some("hey"));
}

#[tokio::test]
async fn test_stop_mid_stream_ignores_late_tokens() {
    let h = user_harness();
    let mut events = h.session.subscribe();
    let feed = h.client.script();

    h.session.submit("count to five").await.unwrap();
    feed.send(Ok(StreamEvent::message("one "))).unwrap();
    feed.send(Ok(StreamEvent::message("two "))).unwrap();
    let mut tokens = 0;
    wait_for(&mut events, |e| {
        if matches!(e, SessionEvent::Token { .. }) {
            tokens += 1;
        }
        tokens == 2
    })
    .await;

    assert!(h.session.stop().await);
    for token in ["three ", "four ", "five"] {
        // The reader is gone; the send may fail once the stream is dropped
        let _ = feed.send(Ok(StreamEvent::message(token)));
    }
    let _ = feed.send(Ok(StreamEvent::done()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = h.session.snapshot();
    assert_ne!(snapshot.status, SessionStatus::Streaming);
    assert_eq!(snapshot.last_assistant_text(), Some("one two "));
    assert_eq!(snapshot.transcript[1].status, MessageStatus::Incomplete);

    let stored = h.store.get_messages("thread-1").await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].content, "one two ");
    assert_eq!(stored[1].status, StoredMessageStatus::Incomplete);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let h = user_harness();
    let _feed = h.client.script();
    h.session.submit("hi").await.unwrap();

    assert!(h.session.stop().await);
    let once = h.session.snapshot();
    assert!(!h.session.stop().await);
    let twice = h.session.snapshot();

    assert_eq!(once.transcript, twice.transcript);
    assert_eq!(once.status, twice.status);
    assert_eq!(once.turn, twice.turn);
}

#[tokio::test]
async fn test_stop_without_stream_is_noop() {
    let h = user_harness();
    assert!(!h.session.stop().await);
    assert_eq!(h.session.status(), SessionStatus::Idle);
    assert!(h.session.transcript().is_empty());
}

#[tokio::test]
async fn test_concurrent_submit_rejected_locally() {
    let h = user_harness();
    let feed = h.client.script();

    h.session.submit("a").await.unwrap();
    feed.send(Ok(StreamEvent::message("par"))).unwrap();
    let err = h.session.submit("b").await.unwrap_err();
    assert!(matches!(err, SubmitError::AlreadyStreaming));
    assert!(err.is_local());
    assert_eq!(h.client.calls(), 1);

    let users: Vec<String> = h
        .session
        .transcript()
        .into_iter()
        .filter(|m| m.is_user())
        .map(|m| m.text_content)
        .collect();
    assert_eq!(users, vec!["a"]);
}

#[tokio::test]
async fn test_empty_input_rejected() {
    let h = user_harness();
    assert!(matches!(
        h.session.submit("  \n").await,
        Err(SubmitError::EmptyInput)
    ));
    assert_eq!(h.client.calls(), 0);
}

#[tokio::test]
async fn test_guest_over_quota_never_reaches_provider() {
    let quota = Arc::new(QuotaTracker::new(1).with_sweep_probability(0.0));
    let h = harness(Identity::Guest("g1".into()), Some(quota.clone()));

    let feed = h.client.script();
    feed.send(Ok(StreamEvent::message("ok"))).unwrap();
    feed.send(Ok(StreamEvent::done())).unwrap();
    h.session.submit("first").await.unwrap();
    h.session.join().await;

    let err = h.session.submit("second").await.unwrap_err();
    match err {
        SubmitError::QuotaExceeded { limit, reset_at } => {
            assert_eq!(limit, 1);
            assert_eq!(reset_at, quota.usage("g1").reset_at);
        }
        other => panic!("expected quota error, got {other:?}"),
    }
    assert_eq!(h.client.calls(), 1);
    assert_eq!(h.session.transcript().len(), 2);
}

#[tokio::test]
async fn test_rejected_submit_does_not_consume_quota() {
    let quota = Arc::new(QuotaTracker::new(3).with_sweep_probability(0.0));
    let h = harness(Identity::Guest("g1".into()), Some(quota.clone()));
    let _feed = h.client.script();

    h.session.submit("a").await.unwrap();
    assert!(h.session.submit("b").await.is_err());
    assert!(h.session.submit("").await.is_err());
    assert_eq!(quota.usage("g1").count, 1);
}

#[tokio::test]
async fn test_first_submit_creates_thread() {
    let h = user_harness();
    let mut events = h.session.subscribe();
    assert!(h.store.get_thread("thread-1").await.unwrap().is_none());

    let _feed = h.client.script();
    h.session.submit("hello").await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, SessionEvent::ThreadCreated { .. })).await;
    assert!(matches!(event, SessionEvent::ThreadCreated { thread_id } if thread_id == "thread-1"));
    let thread = h.store.get_thread("thread-1").await.unwrap().unwrap();
    assert_eq!(thread.user_id, "alice");
}

#[tokio::test]
async fn test_finish_persists_turn_and_invalidates() {
    let h = user_harness();
    let mut events = h.session.subscribe();
    let feed = h.client.script();

    h.session.submit("Plan a weekend in Porto").await.unwrap();
    feed.send(Ok(StreamEvent::reasoning("short answer"))).unwrap();
    feed.send(Ok(StreamEvent::message("Walk the Ribeira."))).unwrap();
    feed.send(Ok(StreamEvent::done())).unwrap();

    let finished = wait_for(&mut events, |e| matches!(e, SessionEvent::Finished { .. })).await;
    wait_for(&mut events, is_invalidated).await;

    let stored = h.store.get_messages("thread-1").await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].content, "Plan a weekend in Porto");
    assert_eq!(stored[1].content, "Walk the Ribeira.");
    assert_eq!(stored[1].reasoning.as_deref(), Some("short answer"));
    match finished {
        SessionEvent::Finished { message_id } => assert_eq!(message_id, Some(stored[1].id.clone())),
        _ => unreachable!(),
    }

    let thread = h.store.get_thread("thread-1").await.unwrap().unwrap();
    assert_eq!(thread.title.as_deref(), Some("Plan a weekend in Porto"));
}

#[tokio::test]
async fn test_stream_closed_without_done_counts_as_finished() {
    let h = user_harness();
    let feed = h.client.script();
    feed.send(Ok(StreamEvent::message("cut short"))).unwrap();
    drop(feed);

    h.session.submit("hi").await.unwrap();
    h.session.join().await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Idle);
    assert_eq!(snapshot.transcript[1].status, MessageStatus::Done);
}

#[tokio::test]
async fn test_stream_error_keeps_partial() {
    let h = user_harness();
    let mut events = h.session.subscribe();
    let feed = h.client.script();

    h.session.submit("hi").await.unwrap();
    feed.send(Ok(StreamEvent::message("Hel"))).unwrap();
    feed.send(Err(anyhow!("connection reset"))).unwrap();

    let failed = wait_for(&mut events, |e| matches!(e, SessionEvent::Failed { .. })).await;
    assert!(matches!(failed, SessionEvent::Failed { error } if error.contains("connection reset")));
    wait_for(&mut events, is_invalidated).await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Error);
    assert_eq!(snapshot.transcript[0].text_content, "hi");
    assert_eq!(snapshot.transcript[1].text_content, "Hel");
    assert_eq!(snapshot.transcript[1].status, MessageStatus::Error);

    let stored = h.store.get_messages("thread-1").await.unwrap();
    assert_eq!(stored[1].status, StoredMessageStatus::Error);

    h.session.dismiss_error();
    assert_eq!(h.session.status(), SessionStatus::Idle);
}

#[tokio::test]
async fn test_provider_open_failure_reports_error() {
    let h = user_harness();
    // No scripted stream: opening the request fails
    let err = h.session.submit("hi").await.unwrap_err();
    assert!(matches!(err, SubmitError::Provider(_)));
    assert_eq!(h.session.status(), SessionStatus::Error);
    assert_eq!(h.session.transcript().len(), 1);
}

#[tokio::test]
async fn test_request_carries_model_key_and_context() {
    let h = user_harness();
    let _feed = h.client.script();
    h.session.submit("hello").await.unwrap();

    let request = h.client.last_request();
    assert_eq!(request.model, "test-model");
    assert_eq!(request.api_key.as_deref(), Some("sk-user"));
    assert_eq!(request.options.temperature, Some(0.2));
    assert_eq!(request.messages[0], Message::system("You are terse."));
    assert_eq!(request.messages[1], Message::user("hello"));
}

#[tokio::test]
async fn test_hydrate_merges_tool_results() {
    let h = user_harness();
    h.store
        .create_thread(Thread::new("thread-1", "alice"))
        .await
        .unwrap();
    h.store
        .save_messages(vec![
            StoredMessage::user("thread-1", "weather?"),
            StoredMessage::assistant("thread-1", "").with_tool_call(StoredToolCall::new(
                "a",
                "weather",
                json!({"city": "Porto"}),
            )),
            StoredMessage::tool("thread-1", "a", r#"{"temp":18}"#),
            StoredMessage::assistant("thread-1", "18C and sunny"),
        ])
        .await
        .unwrap();

    h.session.hydrate().await.unwrap();
    let transcript = h.session.transcript();
    assert_eq!(transcript.len(), 3);
    assert_eq!(transcript[1].tool_invocations[0].result, Some(json!({"temp": 18})));

    // Hydrated thread is not recreated on submit
    let mut events = h.session.subscribe();
    let feed = h.client.script();
    h.session.submit("and tomorrow?").await.unwrap();
    feed.send(Ok(StreamEvent::done())).unwrap();
    wait_for(&mut events, is_invalidated).await;

    let request = h.client.last_request();
    let roles: Vec<&str> = request.messages.iter().map(|m| m.role()).collect();
    assert_eq!(
        roles,
        vec!["system", "user", "assistant", "tool", "assistant", "user"]
    );
}

#[tokio::test]
async fn test_resend_creates_new_turn() {
    let h = user_harness();
    let feed = h.client.script();
    feed.send(Ok(StreamEvent::message("first answer"))).unwrap();
    feed.send(Ok(StreamEvent::done())).unwrap();
    h.session.submit("question").await.unwrap();
    h.session.join().await;

    let original = h.session.transcript()[0].clone();
    let feed = h.client.script();
    feed.send(Ok(StreamEvent::message("second answer"))).unwrap();
    feed.send(Ok(StreamEvent::done())).unwrap();
    h.session.resend(&original.id).await.unwrap();
    h.session.join().await;

    let transcript = h.session.transcript();
    assert_eq!(transcript.len(), 4);
    assert_eq!(transcript[0], original);
    assert_eq!(transcript[2].text_content, "question");
    assert_ne!(transcript[2].id, original.id);
    assert_eq!(transcript[3].text_content, "second answer");
}

#[tokio::test]
async fn test_edit_unknown_message_rejected() {
    let h = user_harness();
    assert!(matches!(
        h.session.edit_and_resubmit("nope", "new").await,
        Err(SubmitError::MessageNotFound(_))
    ));
}

/// In-memory store whose `create_thread` waits until the test opens the gate
#[derive(Default)]
struct GatedStore {
    inner: InMemoryStore,
    entered: Notify,
    gate: Notify,
}

#[async_trait]
impl ThreadStore for GatedStore {
    async fn create_thread(&self, thread: Thread) -> palaver_persist::Result<Thread> {
        self.entered.notify_one();
        self.gate.notified().await;
        self.inner.create_thread(thread).await
    }

    async fn get_thread(&self, thread_id: &str) -> palaver_persist::Result<Option<Thread>> {
        self.inner.get_thread(thread_id).await
    }

    async fn list_threads(&self, query: ThreadQuery) -> palaver_persist::Result<Vec<Thread>> {
        self.inner.list_threads(query).await
    }

    async fn delete_thread(&self, thread_id: &str) -> palaver_persist::Result<()> {
        self.inner.delete_thread(thread_id).await
    }

    async fn change_title(&self, thread_id: &str, title: &str) -> palaver_persist::Result<()> {
        self.inner.change_title(thread_id, title).await
    }

    async fn set_pinned(&self, thread_id: &str, pinned: bool) -> palaver_persist::Result<()> {
        self.inner.set_pinned(thread_id, pinned).await
    }

    async fn set_visibility(
        &self,
        thread_id: &str,
        visibility: Visibility,
    ) -> palaver_persist::Result<()> {
        self.inner.set_visibility(thread_id, visibility).await
    }

    async fn set_project(
        &self,
        thread_id: &str,
        project_id: Option<&str>,
    ) -> palaver_persist::Result<()> {
        self.inner.set_project(thread_id, project_id).await
    }

    async fn get_messages(&self, thread_id: &str) -> palaver_persist::Result<Vec<StoredMessage>> {
        self.inner.get_messages(thread_id).await
    }

    async fn save_messages(&self, messages: Vec<StoredMessage>) -> palaver_persist::Result<()> {
        self.inner.save_messages(messages).await
    }

    async fn create_project(&self, user_id: &str, name: &str) -> palaver_persist::Result<Project> {
        self.inner.create_project(user_id, name).await
    }

    async fn list_projects(&self, user_id: &str) -> palaver_persist::Result<Vec<Project>> {
        self.inner.list_projects(user_id).await
    }
}

#[tokio::test]
async fn test_stop_during_thread_creation_still_persists_user_message() {
    let client = Arc::new(ScriptedClient::default());
    let store = Arc::new(GatedStore::default());
    let session = Arc::new(
        ChatSession::builder()
            .thread_id("thread-1")
            .identity(Identity::User("alice".into()))
            .client(client.clone())
            .store(store.clone())
            .config(SessionConfig::new("test-model"))
            .build()
            .unwrap(),
    );
    let mut events = session.subscribe();
    let _feed = client.script();

    let submit = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.submit("hello there").await }
    });
    store.entered.notified().await;

    assert!(session.stop().await);
    store.gate.notify_one();
    submit.await.unwrap().unwrap();
    wait_for(&mut events, is_invalidated).await;

    assert_eq!(client.calls(), 0, "a stopped turn never reaches the provider");
    let stored = store.get_messages("thread-1").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "hello there");
    let thread = store.get_thread("thread-1").await.unwrap().unwrap();
    assert_eq!(thread.title.as_deref(), Some("hello there"));
    assert_eq!(session.status(), SessionStatus::Idle);
}

#[tokio::test]
async fn test_stop_releases_stalled_provider_stream() {
    let h = user_harness();
    let feed = h.client.script();
    h.session.submit("hi").await.unwrap();

    assert!(h.session.stop().await);
    tokio::time::timeout(Duration::from_secs(2), feed.closed())
        .await
        .expect("provider stream dropped after stop");
}

#[tokio::test]
async fn test_tool_turn_survives_persist_and_rehydrate() {
    let h = user_harness();
    let mut events = h.session.subscribe();
    let feed = h.client.script();
    feed.send(Ok(StreamEvent::ToolCall {
        index: 0,
        id: Some("call_1".into()),
        name: Some("weather".into()),
        arguments: Some(r#"{"city":"Porto"}"#.into()),
    }))
    .unwrap();
    feed.send(Ok(StreamEvent::ToolResult {
        tool_call_id: "call_1".into(),
        result: r#"{"temp":18}"#.into(),
        is_error: false,
    }))
    .unwrap();
    feed.send(Ok(StreamEvent::message("18C in Porto"))).unwrap();
    feed.send(Ok(StreamEvent::done())).unwrap();

    h.session.submit("weather in Porto?").await.unwrap();
    wait_for(&mut events, is_invalidated).await;

    let stored = h.store.get_messages("thread-1").await.unwrap();
    assert!(stored.windows(2).all(|w| w[0].created_at < w[1].created_at));

    let fresh = ChatSession::builder()
        .thread_id("thread-1")
        .identity(Identity::User("alice".into()))
        .client(h.client.clone())
        .store(h.store.clone())
        .build()
        .unwrap();
    fresh.hydrate().await.unwrap();

    let transcript = fresh.transcript();
    assert_eq!(transcript.len(), 2);
    let invocation = &transcript[1].tool_invocations[0];
    assert_eq!(invocation.state, InvocationState::Result);
    assert_eq!(invocation.result, Some(json!({"temp": 18})));
    assert_eq!(transcript[1].text_content, "18C in Porto");
}
