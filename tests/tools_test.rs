//! 内置工具集成测试：经注册表调用，校验沙箱与错误种类

use serde_json::json;

use scout::config::ToolsConfig;
use scout::core::ToolErrorKind;
use scout::ToolRegistry;

fn setup() -> (tempfile::TempDir, ToolRegistry) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("project");
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::write(root.join("src").join("lib.rs"), "pub fn add() {}\n// TODO: sub\n").unwrap();
    let registry = ToolRegistry::with_builtin_tools(&ToolsConfig::rooted_at(&root));
    (dir, registry)
}

#[tokio::test]
async fn test_path_traversal_has_no_side_effect() {
    let (dir, registry) = setup();
    let escaped = dir.path().join("escaped.txt");

    let err = registry
        .try_execute("write_file", json!({"file_path": "../escaped.txt", "content": "x"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ToolErrorKind::PathTraversal);
    assert!(!escaped.exists());

    let text = registry
        .execute("write_file", json!({"file_path": escaped.to_str().unwrap(), "content": "x"}))
        .await;
    assert!(text.starts_with("Error: "));
    assert!(!escaped.exists());
}

#[tokio::test]
async fn test_edit_missing_text_leaves_file() {
    let (dir, registry) = setup();
    let path = dir.path().join("project/src/lib.rs");
    let before = std::fs::read_to_string(&path).unwrap();

    let err = registry
        .try_execute(
            "edit_file",
            json!({"file_path": "src/lib.rs", "old_text": "fn mul", "new_text": "fn div"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ToolErrorKind::Validation);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
}

#[tokio::test]
async fn test_search_tools_see_written_file() {
    let (_dir, registry) = setup();
    registry
        .try_execute("write_file", json!({"file_path": "src/new.rs", "content": "// TODO: tests\n"}))
        .await
        .unwrap();

    let globbed = registry.execute("glob_files", json!({"pattern": "src/*.rs"})).await;
    assert!(globbed.contains("new.rs"));
    assert!(globbed.contains("lib.rs"));

    let grepped = registry.execute("grep_files", json!({"pattern": "TODO"})).await;
    assert!(grepped.starts_with("Found 2 match(es):"));
}

#[tokio::test]
async fn test_unknown_tool_is_text_error() {
    let (_dir, registry) = setup();
    assert_eq!(
        registry.execute("rm_rf", json!({})).await,
        "Error: Unknown tool: rm_rf"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_bash_exit_codes_and_timeout() {
    let (_dir, registry) = setup();

    let ok = registry
        .try_execute("bash", json!({"command": "exit 0", "timeout": 5}))
        .await
        .unwrap();
    assert!(!ok.contains("[exit code"));

    let failed = registry
        .try_execute("bash", json!({"command": "echo oops >&2; exit 3"}))
        .await
        .unwrap();
    assert!(failed.starts_with("STDERR:\noops"));
    assert!(failed.ends_with("[exit code: 3]"));

    let err = registry
        .try_execute("bash", json!({"command": "sleep 5", "timeout": 1}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ToolErrorKind::Timeout);
}
