use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ragnote_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ragnote");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("nested")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.txt"),
        "Beta covers Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("nested").join("gamma.txt"),
        "Gamma has notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();
    fs::write(files_dir.join("image.png"), [0x89, 0x50, 0x4e, 0x47]).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/ragnote.sqlite"

[chunking]
max_tokens = 700
overlap_tokens = 80

[server]
bind = "127.0.0.1:0"
uploads_dir = "{root}/data/uploads"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("ragnote.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ragnote(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ragnote_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ragnote binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn files_dir(config_path: &Path) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("files")
        .display()
        .to_string()
}

fn init_and_ingest(config_path: &Path) {
    let (stdout, stderr, success) = run_ragnote(config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    let (stdout, stderr, success) =
        run_ragnote(config_path, &["ingest", &files_dir(config_path)]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ragnote(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/ragnote.sqlite").exists());
    assert!(tmp.path().join("data/uploads").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_ragnote(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_ragnote(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_ragnote(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "{}", stderr);
}

#[test]
fn test_ingest_indexes_supported_files() {
    let (_tmp, config_path) = setup_test_env();
    run_ragnote(&config_path, &["init"]);

    let (stdout, stderr, success) =
        run_ragnote(&config_path, &["ingest", &files_dir(&config_path)]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("files found: 3"), "{}", stdout);
    assert!(stdout.contains("indexed documents: 3"), "{}", stdout);
    assert!(stdout.contains("ok"));
}

#[test]
fn test_reingest_skips_unchanged() {
    let (_tmp, config_path) = setup_test_env();
    init_and_ingest(&config_path);

    let (stdout, _, success) = run_ragnote(&config_path, &["ingest", &files_dir(&config_path)]);
    assert!(success);
    assert!(stdout.contains("indexed documents: 0"), "{}", stdout);
    assert!(stdout.contains("unchanged: 3"), "{}", stdout);

    let (stdout, _, _) = run_ragnote(&config_path, &["stats"]);
    assert!(stdout.contains("Documents:   3"), "{}", stdout);
}

#[test]
fn test_ingest_include_filter() {
    let (_tmp, config_path) = setup_test_env();
    run_ragnote(&config_path, &["init"]);

    let (stdout, _, success) = run_ragnote(
        &config_path,
        &["ingest", &files_dir(&config_path), "--include", "**/*.md"],
    );
    assert!(success);
    assert!(stdout.contains("files found: 1"), "{}", stdout);
}

#[test]
fn test_keyword_search() {
    let (_tmp, config_path) = setup_test_env();
    init_and_ingest(&config_path);

    let (stdout, stderr, success) = run_ragnote(&config_path, &["search", "kubernetes"]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("gamma.txt"), "{}", stdout);
    assert!(!stdout.contains("alpha.md"), "{}", stdout);
}

#[test]
fn test_search_no_results() {
    let (_tmp, config_path) = setup_test_env();
    init_and_ingest(&config_path);

    let (stdout, _, success) = run_ragnote(&config_path, &["search", "xylophone"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_semantic_search_requires_embeddings() {
    let (_tmp, config_path) = setup_test_env();
    init_and_ingest(&config_path);

    let (_, stderr, success) =
        run_ragnote(&config_path, &["search", "rust", "--mode", "semantic"]);
    assert!(!success);
    assert!(stderr.contains("requires embeddings"), "{}", stderr);
}

#[test]
fn test_unknown_search_mode() {
    let (_tmp, config_path) = setup_test_env();
    init_and_ingest(&config_path);

    let (_, stderr, success) = run_ragnote(&config_path, &["search", "rust", "--mode", "fuzzy"]);
    assert!(!success);
    assert!(stderr.contains("Unknown search mode"), "{}", stderr);
}

#[test]
fn test_ask_without_model_returns_passages() {
    let (_tmp, config_path) = setup_test_env();
    init_and_ingest(&config_path);

    let (stdout, stderr, success) = run_ragnote(&config_path, &["ask", "What about PyTorch?"]);
    assert!(success, "ask failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Deep learning frameworks"), "{}", stdout);
    assert!(stdout.contains("Sources:"), "{}", stdout);
}

#[test]
fn test_ask_before_ingest_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_ragnote(&config_path, &["init"]);

    let (_, stderr, success) = run_ragnote(&config_path, &["ask", "anything?"]);
    assert!(!success);
    assert!(stderr.contains("No documents uploaded yet."), "{}", stderr);
}

#[test]
fn test_documents_get_delete() {
    let (_tmp, config_path) = setup_test_env();
    init_and_ingest(&config_path);

    let (stdout, _, success) = run_ragnote(&config_path, &["documents"]);
    assert!(success);
    let line = stdout
        .lines()
        .find(|l| l.contains("alpha.md"))
        .unwrap_or_else(|| panic!("alpha.md not listed: {}", stdout));
    let id = line.split_whitespace().next().unwrap().to_string();

    let (stdout, _, success) = run_ragnote(&config_path, &["get", &id]);
    assert!(success);
    assert!(stdout.contains("content_type: text/markdown"), "{}", stdout);
    assert!(stdout.contains("cargo and crates"));

    let (stdout, _, success) = run_ragnote(&config_path, &["delete", &id]);
    assert!(success);
    assert!(stdout.contains("Deleted document"));

    let (_, stderr, success) = run_ragnote(&config_path, &["get", &id]);
    assert!(!success);
    assert!(stderr.contains("document not found"), "{}", stderr);
}

#[test]
fn test_embed_pending_requires_provider() {
    let (_tmp, config_path) = setup_test_env();
    run_ragnote(&config_path, &["init"]);

    let (_, stderr, success) = run_ragnote(&config_path, &["embed", "pending"]);
    assert!(!success);
    assert!(stderr.contains("Embedding provider is disabled"), "{}", stderr);
}
