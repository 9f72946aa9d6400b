use assert_cmd::Command;

fn ptyhub() -> Command {
    Command::cargo_bin("ptyhub").unwrap()
}

#[test]
fn help_lists_subcommands() {
    let output = ptyhub().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for sub in ["sessions", "attach", "new", "close"] {
        assert!(stdout.contains(sub), "missing {sub} in help");
    }
}

#[test]
fn attach_requires_a_session() {
    let output = ptyhub().arg("attach").output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn sessions_against_unreachable_server_fails() {
    let output = ptyhub()
        .args(["sessions", "--server", "ws://127.0.0.1:1/ws"])
        .env_remove("PTYHUB_SERVER")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ptyhub: failed to connect"), "stderr: {stderr}");
}
