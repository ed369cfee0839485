//! External command execution
//!
//! Privileged operations (mount, umount, cp, chroot) are executed through the
//! [`CommandRunner`] trait so the hooks can be exercised without root. Commands
//! are run for their effect: stdout is only logged, stderr is kept for the error
//! message when the command fails.

use crate::errors::{ProcessError, Result};
use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;
use tracing::{debug, error, instrument};

/// Runs an external command to completion
pub trait CommandRunner {
    /// Execute `argv` (program followed by its arguments) and return the exit code
    ///
    /// A non-zero exit is an error; callers never see a failing exit code as `Ok`.
    fn run(&self, argv: &[String]) -> Result<i32>;
}

/// Build an argument vector from anything path- or string-like
///
/// Paths are converted lossily; the rootfs and host paths handled here are
/// expected to be valid UTF-8.
pub fn argv<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    args.into_iter()
        .map(|arg| arg.as_ref().to_string_lossy().into_owned())
        .collect()
}

/// Runs commands on the build host with `std::process::Command`
#[derive(Debug, Clone, Default)]
pub struct HostRunner;

impl HostRunner {
    /// Create a new host runner
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for HostRunner {
    #[instrument(skip_all, fields(program = argv.first().map(String::as_str).unwrap_or("")))]
    fn run(&self, argv: &[String]) -> Result<i32> {
        let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;
        debug!("Executing: {}", argv.join(" "));

        let output = Command::new(program).args(args).output().map_err(|e| {
            error!("Failed to spawn {}: {}", program, e);
            ProcessError::ExternalCommand {
                argv: argv.to_vec(),
                exit_code: -1,
                stderr: e.to_string(),
            }
        })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!("[{}] stdout: {}", program, line);
        }

        let exit_code = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!("Command {} failed with exit code {}", argv.join(" "), exit_code);
            return Err(ProcessError::ExternalCommand {
                argv: argv.to_vec(),
                exit_code,
                stderr,
            }
            .into());
        }

        Ok(exit_code)
    }
}

/// Whether the current process runs with an effective uid of 0
///
/// Reads the `Uid:` line of `/proc/self/status`; returns false when the file is
/// unavailable.
pub fn is_privileged() -> bool {
    std::fs::read_to_string(Path::new("/proc/self/status"))
        .ok()
        .and_then(|status| effective_uid(&status))
        .map(|uid| uid == 0)
        .unwrap_or(false)
}

fn effective_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|ids| ids.split_whitespace().nth(1))
        .and_then(|euid| euid.parse().ok())
}

pub mod mock {
    //! Recording command runner for tests
    //!
    //! Nothing is executed. Every argument vector is recorded in order, and
    //! commands can be configured to fail so error paths can be driven without
    //! root privileges.

    use super::CommandRunner;
    use crate::errors::{ProcessError, Result};
    use std::cell::RefCell;
    use tracing::debug;

    /// Configured failure for commands starting with a given prefix
    #[derive(Debug, Clone)]
    struct Failure {
        prefix: Vec<String>,
        exit_code: i32,
        stderr: String,
    }

    /// Command runner that records invocations instead of executing them
    #[derive(Debug, Default)]
    pub struct RecordingRunner {
        history: RefCell<Vec<Vec<String>>>,
        failures: RefCell<Vec<Failure>>,
    }

    impl RecordingRunner {
        /// Create a runner where every command succeeds
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail every command whose argv starts with `prefix`
        pub fn fail_on(&self, prefix: &[&str], exit_code: i32, stderr: &str) {
            self.failures.borrow_mut().push(Failure {
                prefix: prefix.iter().map(|s| s.to_string()).collect(),
                exit_code,
                stderr: stderr.to_string(),
            });
        }

        /// Recorded argument vectors, in execution order
        pub fn history(&self) -> Vec<Vec<String>> {
            self.history.borrow().clone()
        }

        /// Recorded commands joined with spaces, convenient for assertions
        pub fn command_lines(&self) -> Vec<String> {
            self.history.borrow().iter().map(|argv| argv.join(" ")).collect()
        }

        /// Clear recorded history
        pub fn clear_history(&self) {
            self.history.borrow_mut().clear();
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, argv: &[String]) -> Result<i32> {
            if argv.is_empty() {
                return Err(ProcessError::EmptyCommand.into());
            }
            debug!("Recording: {}", argv.join(" "));
            self.history.borrow_mut().push(argv.to_vec());

            let failures = self.failures.borrow();
            if let Some(failure) = failures.iter().find(|f| argv.starts_with(&f.prefix)) {
                return Err(ProcessError::ExternalCommand {
                    argv: argv.to_vec(),
                    exit_code: failure.exit_code,
                    stderr: failure.stderr.clone(),
                }
                .into());
            }
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::RecordingRunner;
    use super::*;
    use crate::errors::RockcraftError;
    use std::path::PathBuf;

    #[test]
    fn test_argv_from_mixed_paths() {
        let target = PathBuf::from("/tmp/rootfs/etc/apt");
        let args = argv([OsStr::new("umount"), target.as_os_str()]);
        assert_eq!(args, vec!["umount", "/tmp/rootfs/etc/apt"]);
    }

    #[test]
    fn test_host_runner_success() {
        let code = HostRunner::new().run(&argv(["true"])).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn test_host_runner_failure_carries_stderr() {
        let err = HostRunner::new()
            .run(&argv(["ls", "/nonexistent_path_12345"]))
            .unwrap_err();
        match err {
            RockcraftError::Process(ProcessError::ExternalCommand {
                argv,
                exit_code,
                stderr,
            }) => {
                assert_eq!(argv[0], "ls");
                assert_ne!(exit_code, 0);
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_host_runner_missing_program() {
        let err = HostRunner::new()
            .run(&argv(["nonexistent_program_12345"]))
            .unwrap_err();
        assert!(err.to_string().contains("nonexistent_program_12345"));
        assert!(err.to_string().contains("exit code -1"));
    }

    #[test]
    fn test_host_runner_empty_command() {
        let err = HostRunner::new().run(&[]).unwrap_err();
        assert!(matches!(
            err,
            RockcraftError::Process(ProcessError::EmptyCommand)
        ));
    }

    #[test]
    fn test_effective_uid_parsing() {
        let status = "Name:\tcat\nUid:\t1000\t0\t1000\t1000\nGid:\t1000\t1000\t1000\t1000\n";
        assert_eq!(effective_uid(status), Some(0));
        assert_eq!(effective_uid("Name:\tcat\n"), None);
    }

    #[test]
    fn test_recording_runner_history_and_failures() {
        let runner = RecordingRunner::new();
        runner.fail_on(&["umount"], 32, "not mounted");

        runner.run(&argv(["mount", "--bind", "/dev", "/r/dev"])).unwrap();
        let err = runner.run(&argv(["umount", "/r/dev"])).unwrap_err();

        assert!(err.to_string().contains("not mounted"));
        assert_eq!(
            runner.command_lines(),
            vec!["mount --bind /dev /r/dev", "umount /r/dev"]
        );

        runner.clear_history();
        assert!(runner.history().is_empty());
    }
}
