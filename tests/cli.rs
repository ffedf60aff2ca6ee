use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn vassist_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("vassist");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let vault = root.join("vault");
    fs::create_dir_all(vault.join("Notes")).unwrap();
    fs::write(vault.join("Notes/A.md"), "# Intro\nHello world").unwrap();
    fs::write(vault.join("Notes/B.md"), "## Todo\nTODO buy milk").unwrap();
    fs::write(vault.join("Notes/diagram.png"), "binary").unwrap();

    let config_content = format!(
        r#"[vault]
root = "{}"

[index]
save_debounce_ms = 0

[retrieval]
max_context = 4

[tools]
enabled = ["find", "grep", "read", "apply_patch"]
"#,
        vault.display()
    );
    let config_path = root.join("vassist.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_vassist(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = vassist_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run vassist binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_index_rebuild_counts_markdown_documents() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_vassist(&config_path, &["index", "rebuild"]);
    assert!(success, "rebuild failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Indexed 2 documents"));
    assert!(tmp.path().join("vault/.vault-assist/index.json").exists());
}

#[test]
fn test_index_status_loads_snapshot() {
    let (_tmp, config_path) = setup_test_env();

    run_vassist(&config_path, &["index", "rebuild"]);
    let (stdout, stderr, success) = run_vassist(&config_path, &["index", "status"]);
    assert!(success, "status failed: stderr={}", stderr);
    assert!(stdout.contains("Documents: 2"));
    assert!(stdout.contains("Indexing:  enabled"));
}

#[test]
fn test_context_prints_todo_chunk() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_vassist(&config_path, &["context", "todo"]);
    assert!(success, "context failed: stderr={}", stderr);
    assert!(stdout.contains("TODO buy milk"));
    assert!(stdout.contains("Notes/B.md > Todo"));
    assert!(!stdout.contains("Hello world"));
}

#[test]
fn test_context_reports_missing_mentions() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_vassist(
        &config_path,
        &["context", "hello", "--mention", "A", "--mention", "Nope"],
    );
    assert!(success, "context failed: stderr={}", stderr);
    assert!(stdout.contains("Hello world"));
    assert!(stderr.contains("not found: Nope"));
}

#[test]
fn test_context_with_active_document() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_vassist(
        &config_path,
        &["context", "todo", "--active", "Notes/A.md", "--cursor", "0"],
    );
    assert!(success, "context failed: stderr={}", stderr);
    assert!(stdout.contains("[active] Notes/A.md > Intro"));
    assert!(stdout.contains("TODO buy milk"));
}

#[test]
fn test_tools_lists_builtins() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_vassist(&config_path, &["tools"]);
    assert!(success, "tools failed: stderr={}", stderr);
    for name in ["find", "grep", "read", "apply_patch", "web_search", "web_fetch"] {
        assert!(stdout.contains(name), "missing {} in {}", name, stdout);
    }
    let web_line = stdout.lines().find(|l| l.starts_with("web_fetch")).unwrap();
    assert!(web_line.contains("disabled"));
}

#[test]
fn test_undo_with_empty_journal() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_vassist(&config_path, &["undo"]);
    assert!(success);
    assert!(stdout.contains("Nothing to undo."));

    let (_, stderr, success) = run_vassist(&config_path, &["undo", "does-not-exist"]);
    assert!(success);
    assert!(stderr.contains("Undo failed"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_vassist(&tmp.path().join("nope.toml"), &["index", "status"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_completions_need_no_config() {
    let tmp = TempDir::new().unwrap();
    let (stdout, _, success) = run_vassist(&tmp.path().join("nope.toml"), &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("vassist"));
}
