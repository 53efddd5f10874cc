//! Integration Test: No Panicking Shortcuts
//!
//! **Policy**: Library and binary code returns errors with `?`. `unwrap()`
//! and `expect()` are for tests only.

use architectural_enforcement::find_violations;

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations = find_violations(&[], |code| {
        code.contains(".unwrap()") || code.contains(".expect(")
    });

    if !violations.is_empty() {
        eprintln!("\n❌ unwrap()/expect() found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        panic!(
            "\nFound {} panicking shortcut(s) in production code.",
            violations.len()
        );
    }
}

#[test]
fn test_unsafe_only_in_platform_bindings() {
    const ALLOWED: [&str; 2] = [
        "xenbus/core/src/transport/readiness.rs",
        "xenbus/core/src/transport/device/setupapi.rs",
    ];

    let violations = find_violations(&ALLOWED, |code| {
        code.starts_with("unsafe ") || code.contains(" unsafe {") || code.contains("unsafe fn")
    });

    assert!(
        violations.is_empty(),
        "unsafe code outside the platform bindings:\n{}",
        violations.join("\n")
    );
}
