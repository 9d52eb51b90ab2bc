//! Stable exit codes for the luigi CLI.

/// Run completed (approved and, when requested, persisted).
pub const OK: i32 = 0;
/// Any error without a more specific code below.
pub const FAILURE: i32 = 1;
/// Configuration invalid or unreadable.
pub const CONFIG: i32 = 2;
/// An agent could not be invoked (spawn failure, timeout, bad output).
pub const AGENT: i32 = 3;
/// The test runner itself failed (not a failing test command).
pub const TEST_RUNNER: i32 = 4;
/// Workspace provisioning or persistence failed.
pub const WORKSPACE: i32 = 5;
/// Run aborted by the user or an observing UI.
pub const ABORTED: i32 = 6;
