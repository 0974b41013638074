use std::{
    borrow::Cow,
    ffi::{OsStr, OsString},
    io,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Command as StdCommand, Output},
};

use log::trace;
use strum_macros::IntoStaticStr;

use blockdev_api::error::{
    BlockDeviceError, BlockDeviceResultExt, ExecutionEnvironmentMisconfigurationError,
    ExecutionError,
};

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Failed to find dependency '{dependency}': {source}")]
    NotFound {
        dependency: Dependency,
        #[source]
        source: which::Error,
    },

    #[error("Failed to execute dependency '{dependency}': {inner}")]
    CouldNotExecute {
        dependency: Dependency,
        #[source]
        inner: io::Error,
    },

    #[error("Dependency '{dependency}' finished unsuccessfully: {explanation}\nCmdline: {rendered_command}\n{output}")]
    ExecutionFailed {
        dependency: Dependency,
        rendered_command: String,
        code: Option<i32>,
        signal: Option<i32>,
        stdout: String,
        stderr: String,
        explanation: String,
        output: String,
    },
}

impl From<DependencyError> for BlockDeviceError {
    #[track_caller]
    fn from(value: DependencyError) -> Self {
        match value {
            DependencyError::NotFound { dependency, source } => BlockDeviceError::with_source(
                ExecutionEnvironmentMisconfigurationError::MissingBinary {
                    binary: dependency.name(),
                },
                source.into(),
            ),
            DependencyError::CouldNotExecute { dependency, inner } => {
                BlockDeviceError::with_source(
                    ExecutionError::CommandCouldNotExecute {
                        binary: dependency.name(),
                    },
                    inner.into(),
                )
            }
            DependencyError::ExecutionFailed {
                dependency,
                ref explanation,
                ..
            } => {
                let kind = ExecutionError::CommandFailed {
                    binary: dependency.name(),
                    explanation: explanation.clone(),
                };
                BlockDeviceError::with_source(kind, value.into())
            }
        }
    }
}

pub trait DependencyResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, BlockDeviceError>;
}

impl<T> DependencyResultExt<T> for Result<T, Box<DependencyError>> {
    #[track_caller]
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, BlockDeviceError> {
        let result: Result<T, BlockDeviceError> = self.map_err(|e| (*e).into());
        result.message(context)
    }
}

/// Enum of runtime and test dependencies used in the code base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Cp,
    Dmsetup,
    Fstrim,
    Kpartx,
    Losetup,
    Lvchange,
    Lvcreate,
    Mkdir,
    Mkfs,
    Mount,
    Mountpoint,
    Partprobe,
    Pvcreate,
    Pvscan,
    Sudo,
    Udevadm,
    Umount,
    Vgchange,
    Vgcreate,
    // Test dependencies
    #[cfg(test)]
    DoesNotExist,
    #[cfg(test)]
    Echo,
    #[cfg(test)]
    False,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

impl Dependency {
    /// Gets the name of the dependency
    ///
    /// For example, Dependency::Losetup => "losetup"
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Checks if the dependency is present in the system
    pub fn exists(&self) -> bool {
        self.path().is_ok()
    }

    /// Gets the path of the dependency
    pub fn path(&self) -> Result<PathBuf, Box<DependencyError>> {
        which::which(self.name()).map_err(|source| {
            Box::new(DependencyError::NotFound {
                dependency: *self,
                source,
            })
        })
    }

    /// Whether the tool changes system state and so must run as root.
    fn needs_privileges(&self) -> bool {
        !matches!(self, Self::Sudo)
    }

    /// Converts the dependency to a new Command instance
    /// (Note this does not create a std::process::Command instance)
    pub fn cmd(&self) -> Command {
        Command {
            dependency: *self,
            args: vec![],
        }
    }
}

/// Runs commands on behalf of the engine.
pub trait Executor {
    fn execute(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>>;
}

/// Runs commands on the host, through `sudo -E` when not already root.
#[derive(Debug, Clone)]
pub struct HostExecutor {
    elevate: bool,
}

impl HostExecutor {
    pub fn new() -> Self {
        Self {
            elevate: !nix::unistd::geteuid().is_root(),
        }
    }
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for HostExecutor {
    fn execute(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>> {
        let mut cmd = if self.elevate && command.dependency.needs_privileges() {
            let mut cmd = StdCommand::new(Dependency::Sudo.path()?);
            cmd.arg("-E").arg(command.dependency.path()?);
            cmd
        } else {
            StdCommand::new(command.dependency.path()?)
        };
        cmd.args(&command.args);

        let output = cmd
            .output()
            .map_err(|inner| DependencyError::CouldNotExecute {
                dependency: command.dependency,
                inner,
            })?;
        Ok(CommandOutput::new(command, output))
    }
}

#[derive(Debug, Clone)]
pub struct Command {
    dependency: Dependency,
    args: Vec<OsString>,
}

impl Command {
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn with_arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg.as_ref());
        }
        self
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    pub fn run_and_check(&self, exec: &dyn Executor) -> Result<(), Box<DependencyError>> {
        self.output(exec)?.check()
    }

    pub fn output_and_check(&self, exec: &dyn Executor) -> Result<String, Box<DependencyError>> {
        self.output(exec)?.check_output()
    }

    pub fn render_command(&self) -> String {
        if self.args.is_empty() {
            self.dependency.to_string()
        } else {
            format!(
                "{} {}",
                self.dependency,
                self.args
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .map(|arg| if arg.contains(' ') {
                        format!("'{arg}'")
                    } else {
                        arg.into()
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        }
    }

    pub fn output(&self, exec: &dyn Executor) -> Result<CommandOutput, Box<DependencyError>> {
        let rendered_command = self.render_command();
        trace!("Executing '{rendered_command}'");
        let output = exec.execute(self)?;
        trace!(
            "Executed '{rendered_command}': {}. Report:\n{}",
            output.explain_exit(),
            output.output_report(),
        );
        Ok(output)
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    rendered_command: String,
    dependency: Dependency,
    inner: Output,
}

impl CommandOutput {
    pub fn new(command: &Command, inner: Output) -> Self {
        Self {
            rendered_command: command.render_command(),
            dependency: command.dependency,
            inner,
        }
    }

    /// Checks if the process exited successfully
    pub fn success(&self) -> bool {
        self.inner.status.success()
    }

    /// Gets the exit code of the process, if it exited normally
    pub fn code(&self) -> Option<i32> {
        self.inner.status.code()
    }

    /// Gets the signal that terminated the process, if it was terminated by a signal
    fn signal(&self) -> Option<i32> {
        self.inner.status.signal()
    }

    /// Gets stderr
    pub fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stderr).into()
    }

    /// Gets stdout
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stdout).into()
    }

    /// Gets all available output, useful for reporting or debugging
    pub fn output_report(&self) -> String {
        let stdout = self.output();
        let stderr = self.error_output();

        let mut res = String::with_capacity(stdout.len() + stderr.len() + 20);

        if !stdout.is_empty() {
            res += &format!("stdout:\n{stdout}\n");
        }

        if !stderr.is_empty() {
            if !res.is_empty() {
                res += "\n";
            }
            res += &format!("stderr:\n{stderr}\n");
        }

        res
    }

    /// Checks if the process exited successfully, otherwise produces an error
    pub fn check(&self) -> Result<(), Box<DependencyError>> {
        if self.success() {
            return Ok(());
        }

        Err(Box::new(DependencyError::ExecutionFailed {
            dependency: self.dependency,
            rendered_command: self.rendered_command.clone(),
            code: self.code(),
            signal: self.signal(),
            stdout: self.output(),
            stderr: self.error_output(),
            explanation: self.explain_exit(),
            output: match self.output_report() {
                s if !s.is_empty() => s,
                _ => "(no output collected)".into(),
            },
        }))
    }

    /// Checks if the process exited successfully and returns the output,
    /// otherwise produces an error with the output
    pub fn check_output(&self) -> Result<String, Box<DependencyError>> {
        self.check()?;
        Ok(self.output())
    }

    /// Produces a string explaining the exit status of the process
    fn explain_exit(&self) -> String {
        if let Some(code) = self.code() {
            format!("exited with status: {code}")
        } else if let Some(signal) = self.signal() {
            format!("terminated by signal: {signal}")
        } else {
            "exited with unknown status".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutils::RecordingExecutor;

    /// Runs test dependencies directly, without privilege elevation.
    struct DirectExecutor;

    impl Executor for DirectExecutor {
        fn execute(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>> {
            let output = StdCommand::new(command.dependency.path()?)
                .args(&command.args)
                .output()
                .map_err(|inner| DependencyError::CouldNotExecute {
                    dependency: command.dependency,
                    inner,
                })?;
            Ok(CommandOutput::new(command, output))
        }
    }

    #[test]
    fn test_command() {
        Dependency::Echo
            .cmd()
            .arg("Hello, world")
            .run_and_check(&DirectExecutor)
            .unwrap();
        let output = Dependency::Echo
            .cmd()
            .arg("Hello, world")
            .output_and_check(&DirectExecutor);
        assert_eq!(output.unwrap(), "Hello, world\n");

        let rendered = Dependency::Echo.cmd().arg("Hello, world").render_command();
        assert_eq!(rendered, "echo 'Hello, world'");
    }

    #[test]
    fn test_arg_and_args() {
        let arg = Dependency::Echo.cmd().arg("Hello, world").output(&DirectExecutor);
        let args = Dependency::Echo
            .cmd()
            .args(["Hello,", "world"])
            .output(&DirectExecutor);

        let arg_output = arg.unwrap().output();
        let args_output = args.unwrap().output();
        assert_eq!(arg_output, args_output);
        assert_eq!(arg_output, "Hello, world\n");
    }

    #[test]
    fn test_nonexistent_dep() {
        let output = Dependency::DoesNotExist
            .cmd()
            .output(&DirectExecutor)
            .unwrap_err();
        assert!(matches!(*output, DependencyError::NotFound { .. }));
        assert_eq!(
            output.to_string(),
            "Failed to find dependency 'doesnotexist': cannot find binary path"
        );
    }

    #[test]
    fn test_commandoutput() {
        let output = Dependency::Echo
            .cmd()
            .arg("Hello, world")
            .output(&DirectExecutor)
            .unwrap();
        assert!(output.success());
        assert_eq!(output.code(), Some(0));
        assert_eq!(output.signal(), None);
        assert_eq!(output.output_report(), "stdout:\nHello, world\n\n");
        assert_eq!(output.explain_exit(), "exited with status: 0");

        let output = Dependency::False.cmd().output(&DirectExecutor).unwrap();
        assert!(!output.success());
        assert_eq!(output.code(), Some(1));
        assert_eq!(output.output_report(), "");
        assert!(matches!(
            *output.check().unwrap_err(),
            DependencyError::ExecutionFailed { .. }
        ));
        assert_eq!(output.explain_exit(), "exited with status: 1");
    }

    #[test]
    fn test_failure_converts_to_structured_error() {
        let exec = RecordingExecutor::new().fail_on("losetup -d /dev/loop9");
        let err = Dependency::Losetup
            .cmd()
            .arg("-d")
            .arg("/dev/loop9")
            .run_and_check(&exec)
            .message("Failed to detach")
            .unwrap_err();
        assert_eq!(
            err.kind().to_string(),
            "Failed to run 'losetup': exited with status: 1"
        );
        assert!(format!("{err:?}").contains("Cmdline: losetup -d /dev/loop9"));
    }
}
