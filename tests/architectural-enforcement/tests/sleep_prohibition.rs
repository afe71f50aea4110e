//! Integration Test: Sleep Prohibition
//!
//! **Policy**: The client waits on I/O, never on the clock. Idle limits use
//! `tokio::time::timeout` around the awaited read.
//! **Exceptions**: test code

use architectural_enforcement::scan;

const SLEEP_PATTERNS: &[&str] = &["::sleep(", ".sleep(", "sleep_until("];

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = scan("medqa/core/src", &[], SLEEP_PATTERNS);
    violations.extend(scan("medqa/cli/src", &[], SLEEP_PATTERNS));

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use instead:");
        eprintln!("  - tokio::time::timeout() around the awaited I/O");
        eprintln!("  - channel receives (store.pump())");

        panic!("\nFound {} sleep violation(s) in production code.", violations.len());
    }
}
