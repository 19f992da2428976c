//! End-to-end tests of the download engine against a local HTTP server.

use std::path::Path;

use voxlaunch::cache::CacheStore;
use voxlaunch::download::{check_file, DownloadSettings, Downloader, Entry, Error, Validation};
use voxlaunch::mirror::{MirrorRule, Mirrors};
use voxlaunch::task::{Status, Task};


const HELLO_SHA1: &str = "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed";

fn downloader(dir: &Path) -> Downloader {
    Downloader::new(
        DownloadSettings::default(),
        Mirrors::disabled(),
        CacheStore::new(dir.join("cache")))
}

#[tokio::test]
async fn check_file_contracts() {

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("file.bin");
    tokio::fs::write(&file, b"hello world").await.unwrap();

    // Existence only.
    assert!(check_file(&file, None, None, Validation::None).await);
    assert!(!check_file(&dir.path().join("missing.bin"), None, None, Validation::None).await);

    // Size passes when the expected size is unknown.
    assert!(check_file(&file, Some(11), None, Validation::Size).await);
    assert!(check_file(&file, None, None, Validation::Size).await);
    assert!(!check_file(&file, Some(10), None, Validation::Size).await);

    // Hash comparison is case-insensitive, and falls back to the size
    // semantics without a checksum.
    assert!(check_file(&file, Some(11), Some(HELLO_SHA1), Validation::Sha1).await);
    assert!(check_file(&file, None, Some(&HELLO_SHA1.to_uppercase()), Validation::Sha1).await);
    assert!(!check_file(&file, None, Some("da39a3ee5e6b4b0d3255bfef95601890afd80709"), Validation::Sha1).await);
    assert!(check_file(&file, None, None, Validation::Sha1).await);

    assert!(check_file(&file, None, Some("5eb63bbbe01eeed093cb22bb8f5acdc3"), Validation::Md5).await);
    assert!(!check_file(&file, None, Some("00000000000000000000000000000000"), Validation::Md5).await);

}

#[tokio::test]
async fn single_download_validated() {

    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();

    let mock = server.mock("GET", "/file.bin")
        .with_body(b"hello world")
        .expect(1)
        .create_async().await;

    let downloader = downloader(dir.path());
    let file = dir.path().join("out/file.bin");

    let mut entry = Entry::new(format!("{}/file.bin", server.url()), file.clone());
    entry.set_expect_size(11);
    entry.set_expect_sha1(HELLO_SHA1);

    assert!(downloader.download(&entry).await);
    assert_eq!(tokio::fs::read(&file).await.unwrap(), b"hello world");
    mock.assert_async().await;

}

#[tokio::test]
async fn retries_exhausted_report_false() {

    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();

    // Every attempt hits the server, default tries is 3.
    let mock = server.mock("GET", "/broken.bin")
        .with_status(500)
        .expect(3)
        .create_async().await;

    let downloader = downloader(dir.path());
    let entry = Entry::new(format!("{}/broken.bin", server.url()), dir.path().join("broken.bin"));

    assert!(!downloader.download(&entry).await);
    mock.assert_async().await;

}

#[tokio::test]
async fn corrupted_body_retries_then_fails() {

    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();

    // The body never matches the expected hash, each attempt re-fetches.
    let mock = server.mock("GET", "/file.bin")
        .with_body(b"corrupted")
        .expect(3)
        .create_async().await;

    let downloader = downloader(dir.path());
    let mut entry = Entry::new(format!("{}/file.bin", server.url()), dir.path().join("file.bin"));
    entry.set_expect_sha1(HELLO_SHA1);

    assert!(!downloader.download(&entry).await);
    mock.assert_async().await;

}

#[tokio::test]
async fn cache_short_circuits_second_download() {

    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();

    let mock = server.mock("GET", "/file.bin")
        .with_body(b"hello world")
        .expect(1)
        .create_async().await;

    let downloader = downloader(dir.path());
    let file = dir.path().join("file.bin");

    let mut entry = Entry::new(format!("{}/file.bin", server.url()), file.clone());
    entry.set_expect_sha1(HELLO_SHA1);
    entry.set_use_cache(true);

    assert!(downloader.download(&entry).await);
    tokio::fs::remove_file(&file).await.unwrap();

    // Served from cache, the mock expectation would fail on a second hit.
    assert!(downloader.download(&entry).await);
    assert_eq!(tokio::fs::read(&file).await.unwrap(), b"hello world");
    mock.assert_async().await;

}

#[tokio::test]
async fn mirror_rewrites_url() {

    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();

    let mock = server.mock("GET", "/mirror/file.bin")
        .with_body(b"hello world")
        .expect(1)
        .create_async().await;

    let mirrors = Mirrors::new(vec![
        MirrorRule {
            name: "local".to_string(),
            test_url: server.url(),
            overrides: vec![("/origin/".to_string(), Some("/mirror/".to_string()))],
            latency: 1,
        },
    ], true);

    let downloader = Downloader::new(
        DownloadSettings::default(),
        mirrors,
        CacheStore::new(dir.path().join("cache")));

    // The origin path does not exist on the server, only the mirror does.
    let entry = Entry::new(format!("{}/origin/file.bin", server.url()), dir.path().join("file.bin"));
    assert!(downloader.download(&entry).await);
    mock.assert_async().await;

}

#[tokio::test]
async fn batch_is_idempotent() {

    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();

    let mock_a = server.mock("GET", "/a.bin")
        .with_body(b"hello world")
        .expect(1)
        .create_async().await;
    let mock_b = server.mock("GET", "/b.bin")
        .with_body(b"bb")
        .expect(1)
        .create_async().await;

    let downloader = downloader(dir.path());

    let entries = || {
        let mut a = Entry::new(format!("{}/a.bin", server.url()), dir.path().join("a.bin"));
        a.set_expect_size(11);
        a.set_expect_sha1(HELLO_SHA1);
        let mut b = Entry::new(format!("{}/b.bin", server.url()), dir.path().join("b.bin"));
        b.set_expect_size(2);
        vec![a, b]
    };

    let task = Task::new("download", Some(2));
    downloader.download_all(entries(), &task).await.unwrap();

    assert!(matches!(task.status(), Status::Done));
    let progress = task.progress().unwrap();
    assert_eq!(progress.success, 2);
    assert_eq!(progress.failed, 0);

    // A second batch over fully valid files makes zero requests, the
    // expectations of one hit each would otherwise fail.
    let task = Task::new("download", Some(2));
    downloader.download_all(entries(), &task).await.unwrap();
    assert!(matches!(task.status(), Status::Done));

    mock_a.assert_async().await;
    mock_b.assert_async().await;

}

#[tokio::test]
async fn batch_partial_failure_aborts_task() {

    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();

    server.mock("GET", "/good.bin")
        .with_body(b"hello world")
        .create_async().await;
    server.mock("GET", "/bad.bin")
        .with_status(404)
        .create_async().await;

    let downloader = downloader(dir.path());

    let good = Entry::new(format!("{}/good.bin", server.url()), dir.path().join("good.bin"));
    let bad = Entry::new(format!("{}/bad.bin", server.url()), dir.path().join("bad.bin"));

    let task = Task::new("download", Some(2));
    let result = downloader.download_all(vec![good, bad], &task).await;

    let Err(Error::Batch { failed, total, url }) = result else {
        panic!("expected a batch error");
    };
    assert_eq!((failed, total), (1, 2));
    assert!(url.contains("/bad.bin"));

    assert!(matches!(task.status(), Status::Failed(_)));
    let progress = task.progress().unwrap();
    assert_eq!(progress.success, 1);
    assert_eq!(progress.failed, 1);

    // The successful sibling stays on disk.
    assert!(dir.path().join("good.bin").is_file());

}
