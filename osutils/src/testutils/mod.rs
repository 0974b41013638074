//! An executor that records commands instead of running them, for tests that need exact command
//! sequences without root.

use std::{
    cell::RefCell,
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Output},
};

use crate::dependencies::{Command, CommandOutput, DependencyError, Executor};

enum Outcome {
    Stdout(String),
    Fail,
}

/// Records every rendered command line. Commands succeed with empty output unless a rule whose
/// prefix matches the command line says otherwise; the first matching rule wins.
#[derive(Default)]
pub struct RecordingExecutor {
    rules: Vec<(String, Outcome)>,
    calls: RefCell<Vec<String>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands starting with `prefix` succeed and print `stdout`.
    pub fn with_output(mut self, prefix: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.rules
            .push((prefix.into(), Outcome::Stdout(stdout.into())));
        self
    }

    /// Commands starting with `prefix` exit with status 1.
    pub fn fail_on(mut self, prefix: impl Into<String>) -> Self {
        self.rules.push((prefix.into(), Outcome::Fail));
        self
    }

    /// Command lines executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Forgets the recorded command lines, keeping the rules.
    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }
}

impl Executor for RecordingExecutor {
    fn execute(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>> {
        let rendered = command.render_command();
        self.calls.borrow_mut().push(rendered.clone());

        let outcome = self
            .rules
            .iter()
            .find(|(prefix, _)| rendered.starts_with(prefix.as_str()))
            .map(|(_, outcome)| outcome);

        let (status, stdout) = match outcome {
            None => (0, Vec::new()),
            Some(Outcome::Stdout(stdout)) => (0, stdout.as_bytes().to_vec()),
            Some(Outcome::Fail) => (1, Vec::new()),
        };

        Ok(CommandOutput::new(
            command,
            Output {
                // Raw wait status: the exit code lives in the second byte.
                status: ExitStatus::from_raw(status << 8),
                stdout,
                stderr: Vec::new(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dependencies::Dependency;

    #[test]
    fn test_recording() {
        let exec = RecordingExecutor::new()
            .with_output("losetup --show", "/dev/loop3\n")
            .fail_on("losetup -d");

        let device = Dependency::Losetup
            .cmd()
            .args(["--show", "-f", "/tmp/image0.raw"])
            .output_and_check(&exec)
            .unwrap();
        assert_eq!(device, "/dev/loop3\n");

        assert!(Dependency::Losetup
            .cmd()
            .args(["-d", "/dev/loop3"])
            .run_and_check(&exec)
            .is_err());

        Dependency::Udevadm.cmd().arg("settle").run_and_check(&exec).unwrap();

        assert_eq!(
            exec.calls(),
            vec![
                "losetup --show -f /tmp/image0.raw",
                "losetup -d /dev/loop3",
                "udevadm settle",
            ]
        );

        exec.clear();
        assert!(exec.calls().is_empty());
    }
}
