//! Integration Test: Sleep Confinement
//!
//! **Policy**: The transports only ever block on device I/O, the readiness
//! bridge, or a retry pause. The one real sleep lives in `ThreadPause`;
//! everything else waits through the `Pause` trait so tests can record
//! delays instead of sleeping.

use architectural_enforcement::find_violations;

const ALLOWED: [&str; 1] = ["xenbus/core/src/transport/retry.rs"];

#[test]
fn test_sleep_only_in_retry_pause() {
    let violations = find_violations(&ALLOWED, |code| {
        code.contains("::sleep(") || code.contains(".sleep(")
    });

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found outside transport/retry.rs!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Wait through a `Pause` so retry delays stay testable.");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}
