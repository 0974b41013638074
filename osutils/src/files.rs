use std::{
    fs::File,
    path::Path,
};

use anyhow::{Context, Error};

use crate::dependencies::{Dependency, Executor};

/// Creates all directories in a path if they don't exist
pub fn create_dirs<S>(path: S) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    std::fs::create_dir_all(path.as_ref()).context(format!(
        "Could not create path: {}",
        path.as_ref().display()
    ))
}

/// Creates a sparse file of `size` bytes, and all parent directories if they don't exist. An
/// existing file is truncated first.
pub fn create_sparse_file<S>(path: S, size: u64) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    if let Some(parent) = path.as_ref().parent() {
        create_dirs(parent)?;
    }

    let file = File::create(path.as_ref()).context(format!(
        "Could not create file: {}",
        path.as_ref().display()
    ))?;
    file.set_len(size).context(format!(
        "Could not resize {} to {size} bytes",
        path.as_ref().display()
    ))
}

/// Creates a directory tree with `mkdir -p`, as root when needed.
pub fn mkdir_p(exec: &dyn Executor, path: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Mkdir
        .cmd()
        .arg("-p")
        .arg(path.as_ref())
        .run_and_check(exec)
        .context(format!(
            "Could not create path: {}",
            path.as_ref().display()
        ))
}

/// Copies a file with `cp`, as root when needed.
pub fn copy(
    exec: &dyn Executor,
    source: impl AsRef<Path>,
    destination: impl AsRef<Path>,
) -> Result<(), Error> {
    Dependency::Cp
        .cmd()
        .arg(source.as_ref())
        .arg(destination.as_ref())
        .run_and_check(exec)
        .context(format!(
            "Could not copy {} to {}",
            source.as_ref().display(),
            destination.as_ref().display()
        ))
}
