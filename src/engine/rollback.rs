//! Undo actions registered by nodes during `create`, replayed in reverse when the phase fails.

use std::path::PathBuf;

use log::{debug, error, info};
use serde::Serialize;

use blockdev_api::error::{BlockDeviceError, ExecutionError, ReportError};
use osutils::{dependencies::Executor, kpartx, losetup, lvm, mount};

/// One undo step. Plain data, so a failed run can dump what it was about to undo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum UndoAction {
    RemoveFile { path: PathBuf },
    DetachLoop { device: PathBuf },
    Unmount { path: PathBuf },
    RemovePartitionMappings { device: PathBuf },
    DeactivateVolumeGroup { name: String },
    DeactivateLogicalVolume { volume_group: String, name: String },
}

impl UndoAction {
    pub fn run(&self, exec: &dyn Executor) -> Result<(), BlockDeviceError> {
        debug!("Rolling back: {self:?}");
        match self {
            UndoAction::RemoveFile { path } => {
                std::fs::remove_file(path).structured(ExecutionError::RemoveImage {
                    path: path.display().to_string(),
                })
            }
            UndoAction::DetachLoop { device } => {
                losetup::detach(exec, device).structured(ExecutionError::DetachLoopDevice {
                    device: device.display().to_string(),
                })
            }
            UndoAction::Unmount { path } => {
                mount::umount(exec, path).structured(ExecutionError::Unmount {
                    mount_point: path.display().to_string(),
                })
            }
            UndoAction::RemovePartitionMappings { device } => kpartx::delete(exec, device)
                .structured(ExecutionError::UnmapPartitions {
                    device: device.display().to_string(),
                }),
            UndoAction::DeactivateVolumeGroup { name } => lvm::deactivate_vg(exec, name)
                .structured(ExecutionError::DeactivateLvm { name: name.clone() }),
            UndoAction::DeactivateLogicalVolume { volume_group, name } => {
                lvm::deactivate_lv(exec, volume_group, name).structured(
                    ExecutionError::DeactivateLvm {
                        name: format!("{volume_group}/{name}"),
                    },
                )
            }
        }
    }
}

/// Undo actions of one node, in registration order.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RollbackStack(Vec<UndoAction>);

impl RollbackStack {
    pub fn push(&mut self, action: UndoAction) {
        self.0.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn actions(&self) -> &[UndoAction] {
        &self.0
    }

    /// Runs and drains the actions, newest first. A failing action does not stop the others;
    /// every failure is logged and returned.
    pub fn unwind(&mut self, exec: &dyn Executor) -> Vec<BlockDeviceError> {
        let mut failures = Vec::new();
        while let Some(action) = self.0.pop() {
            if let Err(e) = action.run(exec) {
                error!("Rollback action {action:?} failed: {e:?}");
                failures.push(e);
            } else {
                info!("Rolled back: {action:?}");
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use osutils::testutils::RecordingExecutor;

    #[test]
    fn test_unwind_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image0.raw");
        std::fs::write(&image, "").unwrap();

        let mut stack = RollbackStack::default();
        stack.push(UndoAction::RemoveFile {
            path: image.clone(),
        });
        stack.push(UndoAction::DetachLoop {
            device: "/dev/loop0".into(),
        });
        stack.push(UndoAction::Unmount {
            path: "/mnt/img".into(),
        });

        let exec = RecordingExecutor::new();
        assert!(stack.unwind(&exec).is_empty());
        assert!(stack.is_empty());
        assert_eq!(exec.calls(), vec!["umount /mnt/img", "losetup -d /dev/loop0"]);
        assert!(!image.exists());
    }

    #[test]
    fn test_unwind_continues_after_failure() {
        let mut stack = RollbackStack::default();
        stack.push(UndoAction::DeactivateVolumeGroup { name: "vg".into() });
        stack.push(UndoAction::DeactivateLogicalVolume {
            volume_group: "vg".into(),
            name: "lv_root".into(),
        });
        stack.push(UndoAction::RemovePartitionMappings {
            device: "/dev/loop0".into(),
        });

        let exec = RecordingExecutor::new().fail_on("lvchange");
        let failures = stack.unwind(&exec);
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].kind().to_string(),
            "Failed to deactivate 'vg/lv_root'"
        );
        assert_eq!(
            exec.calls(),
            vec![
                "kpartx -d /dev/loop0",
                "lvchange -an /dev/vg/lv_root",
                "vgchange -an vg",
            ]
        );
    }

    #[test]
    fn test_serialize() {
        let mut stack = RollbackStack::default();
        stack.push(UndoAction::DetachLoop {
            device: "/dev/loop0".into(),
        });
        assert_eq!(
            serde_json::to_value(&stack).unwrap(),
            serde_json::json!([{"action": "detach-loop", "device": "/dev/loop0"}])
        );
    }
}
