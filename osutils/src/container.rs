use std::path::Path;

/// File docker creates at the root of every container.
const DOCKERENV_PATH: &str = "/.dockerenv";

/// Whether this process runs inside a docker container, where udev does not manage
/// `/dev/mapper`.
pub fn is_running_in_container() -> bool {
    is_container_root(Path::new("/"))
}

fn is_container_root(root: &Path) -> bool {
    root.join(DOCKERENV_PATH.trim_start_matches('/')).exists()
}
