//! Process-level shutdown of the exporter binary.

#![cfg(unix)]

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_sigterm_exits_while_stdin_is_idle() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_p1-exporter"))
        .args(["--device", "-", "--listen-address", "127.0.0.1:0"])
        .args(["--log-level", "info"])
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // Held open and never written, like a decoder on a silent meter.
    let _stdin = child.stdin.take().unwrap();
    let mut lines = BufReader::new(child.stdout.take().unwrap()).lines();
    loop {
        let line = lines.next().expect("exporter exited before ingesting").unwrap();
        if line.contains("Ingestion started") {
            break;
        }
    }
    // Let the signal handlers install.
    thread::sleep(Duration::from_millis(300));

    let status = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let deadline = Instant::now() + Duration::from_secs(10);
    let exit = loop {
        if let Some(exit) = child.try_wait().unwrap() {
            break exit;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("exporter still running after SIGTERM");
        }
        thread::sleep(Duration::from_millis(50));
    };
    assert!(exit.success(), "exporter exited with {exit}");
}
