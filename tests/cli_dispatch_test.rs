// tests/cli_dispatch_test.rs

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::File;
use std::io::Write;
use tempfile::tempdir;

// 辅助函数，避免重复。HOME 指向临时目录，避免读写真实的配置文件
fn main_command(home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin(env!("CARGO_PKG_NAME")).unwrap();
    cmd.env("HOME", home).env_remove("TRACK_DL_TOKEN");
    cmd
}

// --- 测试基本 CLI 行为 ---

#[test]
fn test_help_flag() {
    let home = tempdir().unwrap();
    main_command(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("显示此帮助信息并退出"))
        .stdout(predicate::str::contains("--batch-file"));
}

#[test]
fn test_token_help_command() {
    let home = tempdir().unwrap();
    main_command(home.path())
        .arg("--token-help")
        .assert()
        .success()
        .stdout(predicate::str::contains("TRACK_DL_TOKEN"));
}

#[test]
fn test_missing_mode_shows_help() {
    let home = tempdir().unwrap();
    main_command(home.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage: track-dl <MODE> [OPTIONS]"));
}

#[test]
fn test_track_mode_requires_source_url() {
    let home = tempdir().unwrap();
    main_command(home.path())
        .arg("--track")
        .arg("42")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--source-url <URL>"));
}

// --- 测试核心分发逻辑 ---

#[test]
fn test_batch_without_token_is_rejected() {
    let home = tempdir().unwrap();
    let file_path = home.path().join("tracks.tsv");
    let mut file = File::create(&file_path).unwrap();
    writeln!(file, "# id\ttitle\tartist\turl").unwrap();
    writeln!(file, "1\tSong\tBand\thttps://cdn.example/1.mp3").unwrap();

    main_command(home.path())
        .arg("-b")
        .arg(&file_path)
        .arg("--server")
        .arg("http://127.0.0.1:9")
        .assert()
        .failure()
        .stderr(predicate::str::contains("未登录"));
}

#[test]
fn test_empty_batch_file_is_rejected() {
    let home = tempdir().unwrap();
    let file_path = home.path().join("empty.tsv");
    File::create(&file_path).unwrap();

    main_command(home.path())
        .arg("-b")
        .arg(&file_path)
        .arg("--token")
        .arg("secret")
        .assert()
        .failure()
        .stderr(predicate::str::contains("未选择任何曲目"));
}

#[test]
fn test_invalid_batch_line_is_reported() {
    let home = tempdir().unwrap();
    let file_path = home.path().join("bad.tsv");
    let mut file = File::create(&file_path).unwrap();
    writeln!(file, "not-a-number\tSong").unwrap();

    main_command(home.path())
        .arg("-b")
        .arg(&file_path)
        .arg("--token")
        .arg("secret")
        .assert()
        .failure()
        .stderr(predicate::str::contains("不是有效的数字"));
}
