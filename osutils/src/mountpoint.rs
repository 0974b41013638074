use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::{Dependency, DependencyError, Executor};

pub fn check_is_mountpoint(exec: &dyn Executor, path: impl AsRef<Path>) -> Result<bool, Error> {
    let output = Dependency::Mountpoint
        .cmd()
        .arg("-q")
        .arg(path.as_ref())
        .run_and_check(exec);
    match output {
        Ok(()) => Ok(true),
        Err(e) => {
            if let DependencyError::ExecutionFailed { .. } = *e {
                Ok(false)
            } else {
                Err(e).with_context(|| {
                    format!(
                        "Failed to determine if '{}' is a mount point.",
                        path.as_ref().display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutils::RecordingExecutor;

    #[test]
    fn test_check_is_mountpoint() {
        let exec = RecordingExecutor::new().fail_on("mountpoint -q /mnt/img/var");
        assert!(check_is_mountpoint(&exec, "/mnt/img").unwrap());
        assert!(!check_is_mountpoint(&exec, "/mnt/img/var").unwrap());
        assert_eq!(
            exec.calls(),
            vec!["mountpoint -q /mnt/img", "mountpoint -q /mnt/img/var"]
        );
    }
}
