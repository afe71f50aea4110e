//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: The streaming paths (protocol, session, conversation, backend)
//! MUST NOT use blocking I/O.
//! **Exceptions**: `config`, which reads its file once before any stream opens,
//! and test code.

use architectural_enforcement::scan;

const BLOCKING_PATTERNS: &[&str] = &[
    "std::fs",
    "std::net",
    "std::thread::sleep",
    "std::process",
    "reqwest::blocking",
    ".blocking_recv(",
    ".blocking_send(",
];

#[test]
fn test_no_blocking_io_in_streaming_paths() {
    let violations = scan("medqa/core/src", &["config"], BLOCKING_PATTERNS);

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found on the streaming paths!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - reqwest::Client with bytes_stream()");
        eprintln!("  - tokio::sync::mpsc for cross-task updates");

        panic!(
            "\nFound {} blocking I/O violation(s) on the streaming paths.",
            violations.len()
        );
    }
}

#[test]
fn test_reqwest_blocking_never_used() {
    let violations = scan("medqa", &[], &["reqwest::blocking"]);
    assert!(violations.is_empty(), "reqwest::blocking used: {violations:?}");
}
