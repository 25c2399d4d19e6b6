//! End-to-end tests: snapshot a directory, clone and push over HTTP

use std::path::{Path, PathBuf};
use std::process::Output;

use dirgit_core::{Config, GitService, StagingMode};
use tempfile::TempDir;
use tokio::process::Command;

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn git(dir: &Path, args: &[&str]) -> Output {
    Command::new("git")
        .args([
            "-c",
            "user.name=dirgit test",
            "-c",
            "user.email=test@example.com",
        ])
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .expect("failed to run git")
}

fn service(temp: &TempDir) -> GitService {
    let mut config = Config::default();
    config.snapshot.staging_dir = temp.path().join("staging");
    config.snapshot.staging_mode = StagingMode::PerSource;
    config.server.bind_host = "127.0.0.1".to_string();
    GitService::new(config).unwrap()
}

fn source(temp: &TempDir) -> PathBuf {
    let dir = temp.path().join("source");
    std::fs::create_dir_all(dir.join("src")).unwrap();
    std::fs::write(dir.join("README.md"), "# project\n").unwrap();
    std::fs::write(dir.join("src/main.rs"), "fn main() {}\n").unwrap();
    dir
}

#[tokio::test]
async fn test_info_refs_advertisement() {
    if !git_available() {
        return;
    }

    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let port = service.add_git(source(&temp)).await.unwrap();

    let url = format!(
        "http://127.0.0.1:{}/owner/repo/info/refs?service=git-upload-pack",
        port
    );
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-git-upload-pack-advertisement"
    );

    let body = response.bytes().await.unwrap();
    assert!(body.starts_with(b"001e# service=git-upload-pack\n0000"));
    assert!(String::from_utf8_lossy(&body).contains("refs/heads/master"));

    service.shutdown().await;
}

#[tokio::test]
async fn test_unknown_repository_name() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let port = service.add_git(source(&temp)).await.unwrap();

    let url = format!(
        "http://127.0.0.1:{}/just-one-segment/info/refs?service=git-upload-pack",
        port
    );
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 404);

    service.shutdown().await;
}

#[tokio::test]
async fn test_clone_matches_source() {
    if !git_available() {
        return;
    }

    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let port = service.add_git(source(&temp)).await.unwrap();
    let url = service.clone_url(port, "owner/repo.git").unwrap();

    let output = git(temp.path(), &["clone", url.as_str(), "cloned"]).await;
    assert!(
        output.status.success(),
        "clone failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let cloned = temp.path().join("cloned");
    assert_eq!(
        std::fs::read_to_string(cloned.join("README.md")).unwrap(),
        "# project\n"
    );
    assert_eq!(
        std::fs::read_to_string(cloned.join("src/main.rs")).unwrap(),
        "fn main() {}\n"
    );

    let count = git(&cloned, &["rev-list", "--count", "HEAD"]).await;
    assert_eq!(String::from_utf8_lossy(&count.stdout).trim(), "1");

    let branch = git(&cloned, &["rev-parse", "--abbrev-ref", "HEAD"]).await;
    assert_eq!(String::from_utf8_lossy(&branch.stdout).trim(), "master");

    service.shutdown().await;
}

#[tokio::test]
async fn test_push_restricted_to_default_branch() {
    if !git_available() {
        return;
    }

    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let port = service.add_git(source(&temp)).await.unwrap();
    let url = format!("http://127.0.0.1:{}/owner/repo.git", port);

    let output = git(temp.path(), &["clone", &url, "work"]).await;
    assert!(output.status.success());

    let work = temp.path().join("work");
    std::fs::write(work.join("CHANGES"), "more\n").unwrap();
    assert!(git(&work, &["add", "CHANGES"]).await.status.success());
    assert!(git(&work, &["commit", "-m", "change"]).await.status.success());

    let rejected = git(&work, &["push", "origin", "HEAD:refs/heads/feature"]).await;
    assert!(!rejected.status.success());

    let accepted = git(&work, &["push", "origin", "HEAD:refs/heads/master"]).await;
    assert!(
        accepted.status.success(),
        "push failed: {}",
        String::from_utf8_lossy(&accepted.stderr)
    );

    let refs = reqwest::get(format!(
        "http://127.0.0.1:{}/owner/repo/info/refs?service=git-upload-pack",
        port
    ))
    .await
    .unwrap()
    .text()
    .await
    .unwrap();
    assert!(!refs.contains("refs/heads/feature"));

    service.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_refuses_new_connections() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let port = service.add_git(source(&temp)).await.unwrap();

    service.shutdown().await;

    let url = format!("http://127.0.0.1:{}/owner/repo/info/refs", port);
    assert!(reqwest::get(&url).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_add_git_single_server() {
    let temp = TempDir::new().unwrap();
    let service = std::sync::Arc::new(service(&temp));
    let dir = source(&temp);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service = std::sync::Arc::clone(&service);
        let dir = dir.clone();
        tasks.push(tokio::spawn(async move { service.add_git(&dir).await.unwrap() }));
    }

    let mut ports = Vec::new();
    for task in tasks {
        ports.push(task.await.unwrap());
    }
    ports.dedup();
    assert_eq!(ports.len(), 1);
    assert_eq!(
        service.state().await,
        dirgit_core::ServiceState::Serving(1)
    );

    service.shutdown().await;
}
