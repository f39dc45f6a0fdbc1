//! 引擎主循环集成测试（脚本化后端驱动）

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use scout::config::{EngineConfig, ToolsConfig};
use scout::core::{AllowAll, DenyAll, EngineError, EngineEvent, EnginePhase, FnPermission, PERMISSION_DENIED_RESULT};
use scout::llm::{Response, ScriptedAdapter, ToolCall};
use scout::memory::{HistoryStore, Role};
use scout::tools::PathSandbox;
use scout::{Engine, ToolRegistry};

fn registry(dir: &Path) -> Arc<ToolRegistry> {
    Arc::new(ToolRegistry::with_builtin_tools(&ToolsConfig::rooted_at(dir)))
}

fn builder(adapter: ScriptedAdapter, dir: &Path) -> scout::EngineBuilder {
    Engine::builder(EngineConfig::default())
        .with_provider(Box::new(adapter))
        .with_registry(registry(dir))
        .with_history(HistoryStore::ephemeral().unwrap())
        .with_workspace(PathSandbox::rooted(dir))
}

fn glob_call() -> ToolCall {
    ToolCall::new("glob_files", json!({"pattern": "*.txt"}))
}

#[tokio::test]
async fn test_n_tool_rounds_give_n_batches() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("one.txt"), "1").unwrap();

    let adapter = ScriptedAdapter::new("m")
        .with_response(Response::tool_calls(vec![glob_call()]))
        .with_response(Response::tool_calls(vec![glob_call(), glob_call()]))
        .with_response(Response::tool_calls(vec![glob_call()]))
        .with_response(Response::text("Found one text file."));
    let log = adapter.log();
    let mut engine = builder(adapter, dir.path())
        .with_permission(Arc::new(AllowAll))
        .build()
        .unwrap();
    engine.initialize().await.unwrap();

    let reply = engine.send("list text files", &[]).await.unwrap();
    assert_eq!(reply, "Found one text file.");

    let log = log.lock().await;
    assert_eq!(log.tool_result_batches(), 3);
    // 第二轮两个调用合并为一个批次
    let batches = log.result_batches();
    assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), [1, 2, 1]);

    let session = engine.history().unwrap().current().unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].role, Role::User);
    assert_eq!(session.messages[1].role, Role::Model);
    assert_eq!(
        session.total_tokens,
        session.messages.iter().map(|m| m.token_count).sum::<usize>()
    );
}

#[tokio::test]
async fn test_denied_write_creates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = ScriptedAdapter::new("m")
        .with_response(Response::tool_calls(vec![ToolCall::new(
            "write_file",
            json!({"file_path": "out.txt", "content": "data"}),
        )]))
        .with_response(Response::text("Understood, not writing."));
    let log = adapter.log();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut engine = builder(adapter, dir.path())
        .with_permission(Arc::new(DenyAll))
        .with_event_tx(tx)
        .build()
        .unwrap();
    engine.initialize().await.unwrap();

    engine.send("write out.txt", &[]).await.unwrap();
    assert!(!dir.path().join("out.txt").exists());

    let batches = log.lock().await.result_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0].name, "write_file");
    assert_eq!(batches[0][0].result, PERMISSION_DENIED_RESULT);

    let mut denied = false;
    while let Ok(ev) = rx.try_recv() {
        if ev == (EngineEvent::PermissionDenied { tool: "write_file".into() }) {
            denied = true;
        }
    }
    assert!(denied);
}

#[tokio::test]
async fn test_read_only_tools_skip_the_gate() {
    let dir = tempfile::tempdir().unwrap();
    let asked = Arc::new(AtomicUsize::new(0));
    let counter = asked.clone();
    let gate = FnPermission(move |_: &str, _: &Value| {
        counter.fetch_add(1, Ordering::SeqCst);
        true
    });

    let adapter = ScriptedAdapter::new("m")
        .with_response(Response::tool_calls(vec![
            glob_call(),
            ToolCall::new("bash", json!({"command": "echo hi"})),
        ]))
        .with_response(Response::text("done"));
    let mut engine = builder(adapter, dir.path())
        .with_permission(Arc::new(gate))
        .with_auto_approve_read_only(true)
        .build()
        .unwrap();
    engine.initialize().await.unwrap();

    engine.send("go", &[]).await.unwrap();
    assert_eq!(asked.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tool_loop_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut adapter = ScriptedAdapter::new("m");
    for _ in 0..3 {
        adapter = adapter.with_response(Response::tool_calls(vec![glob_call()]));
    }
    let log = adapter.log();
    let mut engine = Engine::builder(EngineConfig { max_tool_rounds: 2 })
        .with_provider(Box::new(adapter))
        .with_registry(registry(dir.path()))
        .with_workspace(PathSandbox::rooted(dir.path()))
        .build()
        .unwrap();
    engine.initialize().await.unwrap();

    let err = engine.send("loop forever", &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::ToolLoopLimit(2)));
    assert_eq!(log.lock().await.tool_result_batches(), 2);
    assert_eq!(engine.phase(), EnginePhase::Idle);

    // 第三轮的调用已补上结果，后端接受下一条消息
    let reply = engine.send("stop and summarize", &[]).await.unwrap();
    assert_eq!(reply, "Echo: stop and summarize");
    assert_eq!(log.lock().await.settled.len(), 1);
}

#[tokio::test]
async fn test_distinct_calls_keep_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("in.txt"), "input").unwrap();
    let calls = vec![
        ToolCall::new("read_file", json!({"file_path": "in.txt"})),
        ToolCall::new("bash", json!({"command": "echo hi"})),
        ToolCall::new("write_file", json!({"file_path": "out.txt", "content": "output"})),
    ];
    let ids: Vec<String> = calls.iter().map(|c| c.id.clone()).collect();
    let adapter = ScriptedAdapter::new("m")
        .with_response(Response::tool_calls(calls))
        .with_response(Response::text("all three done"));
    let log = adapter.log();
    let mut engine = builder(adapter, dir.path())
        .with_permission(Arc::new(AllowAll))
        .build()
        .unwrap();
    engine.initialize().await.unwrap();

    assert_eq!(engine.send("do three things", &[]).await.unwrap(), "all three done");

    let batches = log.lock().await.result_batches();
    assert_eq!(batches.len(), 1);
    let names: Vec<&str> = batches[0].iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["read_file", "bash", "write_file"]);
    let got: Vec<&str> = batches[0].iter().map(|r| r.id.as_str()).collect();
    assert_eq!(got, ids);
    assert!(batches[0][0].result.contains("input"));
    assert!(batches[0][1].result.contains("hi"));
    assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "output");
}

#[tokio::test]
async fn test_cancel_during_tools_then_next_turn() {
    let dir = tempfile::tempdir().unwrap();
    let calls = vec![
        ToolCall::new("write_file", json!({"file_path": "a.txt", "content": "a"})),
        ToolCall::new("write_file", json!({"file_path": "b.txt", "content": "b"})),
    ];
    let ids: Vec<String> = calls.iter().map(|c| c.id.clone()).collect();
    let adapter = ScriptedAdapter::new("m").with_response(Response::tool_calls(calls));
    let log = adapter.log();

    // 第二个写入获批的同时用户按下取消
    let slot: Arc<OnceLock<CancellationToken>> = Arc::new(OnceLock::new());
    let gate_slot = slot.clone();
    let gate = FnPermission(move |_: &str, args: &Value| {
        if args["file_path"] == "b.txt" {
            if let Some(token) = gate_slot.get() {
                token.cancel();
            }
        }
        true
    });
    let mut engine = builder(adapter, dir.path())
        .with_permission(Arc::new(gate))
        .build()
        .unwrap();
    engine.initialize().await.unwrap();
    slot.set(engine.cancel_token()).unwrap();

    let err = engine.send("write both", &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
    assert!(dir.path().join("a.txt").exists());
    assert!(!dir.path().join("b.txt").exists());

    {
        let log = log.lock().await;
        assert_eq!(log.settled.len(), 2);
        assert_eq!(log.settled[0].id, ids[0]);
        assert!(!log.settled[0].result.contains("interrupted"));
        assert_eq!(log.settled[1].id, ids[1]);
        assert!(log.settled[1].result.contains("interrupted"));
    }

    assert!(!engine.cancel_token().is_cancelled());
    assert_eq!(engine.send("next", &[]).await.unwrap(), "Echo: next");
}

#[tokio::test]
async fn test_sync_send_matches_streaming() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
    let adapter = ScriptedAdapter::new("m")
        .with_response(Response {
            content: Some("Checking. ".into()),
            function_calls: vec![ToolCall::new("read_file", json!({"file_path": "a.txt"}))],
        })
        .with_response(Response::text("It says alpha."));
    let mut engine = builder(adapter, dir.path()).build().unwrap();
    engine.initialize().await.unwrap();

    let reply = engine.send_sync("read a.txt", &[]).await.unwrap();
    assert_eq!(reply, "Checking. It says alpha.");
    let messages = engine.history().unwrap().recent_messages(10);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Checking. It says alpha.");
}

#[tokio::test]
async fn test_phase_transitions_published() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = ScriptedAdapter::new("m")
        .with_response(Response::tool_calls(vec![glob_call()]))
        .with_response(Response::text("ok"));
    let mut engine = builder(adapter, dir.path()).build().unwrap();
    let mut phases = engine.subscribe_phase();
    engine.initialize().await.unwrap();

    engine.send("hi", &[]).await.unwrap();
    assert!(phases.has_changed().unwrap());
    assert_eq!(*phases.borrow_and_update(), EnginePhase::Idle);
}

#[tokio::test]
async fn test_clear_history_resets_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = builder(ScriptedAdapter::new("m"), dir.path()).build().unwrap();
    engine.initialize().await.unwrap();
    engine.send("first", &[]).await.unwrap();
    let before = engine.history().unwrap().current_session_id().unwrap().to_string();

    engine.clear_history().await.unwrap();
    let session = engine.history().unwrap().current().unwrap();
    assert_ne!(session.session_id, before);
    assert!(session.messages.is_empty());
    assert_eq!(engine.history().unwrap().list_sessions(10).unwrap().len(), 2);
}

#[tokio::test]
async fn test_direct_tool_calls() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.py"), "print('hi')\n").unwrap();
    let engine = builder(ScriptedAdapter::new("m"), dir.path()).build().unwrap();

    let result = engine.apply_edit("main.py", "hi", "bye").await.unwrap();
    assert!(result.contains("1 replacement(s)"));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("main.py")).unwrap(),
        "print('bye')\n"
    );
    assert!(engine.apply_edit("main.py", "absent", "x").await.is_err());
}
