//! Runs plan-provided test commands in a candidate workspace.
//!
//! Failing or timing out commands are data for the reviewers, never control
//! flow: every command runs regardless of earlier failures, and the captured
//! (truncated) output lands in the candidate's test report.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info};

use crate::core::types::{CommandRecord, TestCommand, TestReport};
use crate::error::LuigiError;
use crate::io::config::TestingConfig;
use crate::io::process::{TIMEOUT_EXIT_CODE, run_with_timeout};

/// Character cap per captured stream in a [`CommandRecord`].
const RECORD_OUTPUT_CHARS: usize = 8_000;

/// Run the plan's test commands (or the configured fallbacks) in `workdir`.
///
/// `plan_commands: None` means the plan deferred to the fallback unit and
/// end-to-end commands; an empty list means the plan explicitly asked for no
/// tests.
pub fn run_tests(
    workdir: &Path,
    config: &TestingConfig,
    plan_commands: Option<&[TestCommand]>,
) -> Result<TestReport> {
    let mut report = TestReport::default();

    // Optional best-effort dependency install for Node projects.
    if config.install_if_missing
        && workdir.join("package.json").exists()
        && !workdir.join("node_modules").exists()
    {
        info!("dependency directory missing, running install command");
        let record = run_one(
            workdir,
            &TestCommand {
                argv: config.install_command.clone(),
                cwd: None,
                timeout_secs: None,
            },
            config,
        )?;
        let failed = !record.passed();
        report.installed_deps = Some(record);
        if failed {
            // Tests would fail for the same reason; surface the install
            // failure instead of a wall of broken test output.
            return Ok(report);
        }
    }

    let fallback: Vec<TestCommand>;
    let commands: &[TestCommand] = match plan_commands {
        Some(commands) => commands,
        None => {
            fallback = vec![
                TestCommand {
                    argv: config.unit_command.clone(),
                    cwd: None,
                    timeout_secs: None,
                },
                TestCommand {
                    argv: config.e2e_command.clone(),
                    cwd: None,
                    timeout_secs: None,
                },
            ];
            &fallback
        }
    };

    for command in commands {
        if command.argv.is_empty() {
            continue;
        }
        let record = run_one(workdir, command, config)?;
        debug!(argv = ?record.argv, exit = record.exit_code, "test command finished");
        report.commands.push(record);
    }

    Ok(report)
}

fn run_one(workdir: &Path, command: &TestCommand, config: &TestingConfig) -> Result<CommandRecord> {
    let program = command
        .argv
        .first()
        .ok_or_else(|| anyhow!(LuigiError::TestRunner("empty test command".to_string())))?;
    let mut cmd = Command::new(program);
    cmd.args(&command.argv[1..]);
    let cwd = match &command.cwd {
        Some(rel) if rel.is_absolute() => rel.clone(),
        Some(rel) => workdir.join(rel),
        None => workdir.to_path_buf(),
    };
    cmd.current_dir(cwd);

    let timeout = Duration::from_secs(command.timeout_secs.unwrap_or(config.timeout_secs));
    let run = run_with_timeout(cmd, None, timeout, config.output_limit_bytes).map_err(|err| {
        anyhow!(LuigiError::TestRunner(format!(
            "run {:?}: {err:#}",
            command.argv
        )))
    })?;

    let mut stderr = truncate_chars(&run.stderr, RECORD_OUTPUT_CHARS);
    if run.timed_out {
        let notice = format!("Timed out after {} seconds.", timeout.as_secs());
        stderr = if stderr.is_empty() {
            notice
        } else {
            format!("{notice}\n{stderr}")
        };
    }

    Ok(CommandRecord {
        argv: command.argv.clone(),
        exit_code: if run.timed_out { TIMEOUT_EXIT_CODE } else { run.exit_code },
        duration_ms: run.elapsed.as_millis() as u64,
        stdout: truncate_chars(&run.stdout, RECORD_OUTPUT_CHARS),
        stderr,
        timed_out: run.timed_out,
    })
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let truncated: String = text.chars().take(limit).collect();
    format!("{truncated}\n... [truncated] ...")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn config() -> TestingConfig {
        TestingConfig {
            timeout_secs: 30,
            ..TestingConfig::default()
        }
    }

    fn sh(script: &str) -> TestCommand {
        TestCommand {
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            cwd: None,
            timeout_secs: None,
        }
    }

    #[test]
    fn failing_command_does_not_abort_remaining_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let commands = vec![sh("exit 7"), sh("echo second")];
        let report = run_tests(temp.path(), &config(), Some(&commands)).expect("run");
        assert_eq!(report.commands.len(), 2);
        assert_eq!(report.commands[0].exit_code, 7);
        assert!(report.commands[1].passed());
        assert_eq!(report.commands[1].stdout.trim(), "second");
        assert!(!report.all_passed());
    }

    #[test]
    fn per_command_timeout_overrides_global() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut slow = sh("sleep 30");
        slow.timeout_secs = Some(1);
        let report = run_tests(temp.path(), &config(), Some(&[slow])).expect("run");
        assert!(report.commands[0].timed_out);
        assert_eq!(report.commands[0].exit_code, TIMEOUT_EXIT_CODE);
        assert!(report.commands[0].stderr.contains("Timed out after 1 seconds."));
    }

    #[test]
    fn null_plan_commands_fall_back_to_configured_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = config();
        cfg.unit_command = vec!["sh".to_string(), "-c".to_string(), "echo unit".to_string()];
        cfg.e2e_command = vec!["sh".to_string(), "-c".to_string(), "echo e2e".to_string()];
        let report = run_tests(temp.path(), &cfg, None).expect("run");
        assert_eq!(report.commands.len(), 2);
        assert_eq!(report.commands[0].stdout.trim(), "unit");
        assert_eq!(report.commands[1].stdout.trim(), "e2e");
    }

    #[test]
    fn empty_plan_command_list_runs_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = run_tests(temp.path(), &config(), Some(&[])).expect("run");
        assert!(report.commands.is_empty());
    }

    #[test]
    fn install_if_missing_runs_and_skips_tests_on_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("package.json"), "{}").expect("write");

        let mut cfg = config();
        cfg.install_if_missing = true;
        cfg.install_command = vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()];

        let commands = vec![sh("echo should-not-run")];
        let report = run_tests(temp.path(), &cfg, Some(&commands)).expect("run");
        let install = report.installed_deps.expect("install record");
        assert_eq!(install.exit_code, 1);
        assert!(report.commands.is_empty());
    }

    #[test]
    fn command_cwd_resolves_relative_to_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("sub")).expect("mkdir");
        let mut command = sh("basename \"$PWD\"");
        command.cwd = Some("sub".into());
        let report = run_tests(temp.path(), &config(), Some(&[command])).expect("run");
        assert_eq!(report.commands[0].stdout.trim(), "sub");
    }
}
