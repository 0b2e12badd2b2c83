//! net_cls cgroup writer used to tag the target's packets with a classid.

use crate::error::{ChaosnetError, Result};
use std::fs;
use std::path::PathBuf;

pub trait CgroupManager: Send + Sync {
    fn write(&self, controller: &str, file: &str, value: &str) -> Result<()>;

    fn exists(&self, controller: &str) -> Result<bool>;
}

/// cgroup filesystem writer rooted at /sys/fs/cgroup; `pod_path` is the
/// target pod's slice relative to each controller root.
pub struct FsCgroup {
    root: PathBuf,
    pod_path: String,
}

impl FsCgroup {
    pub fn new(pod_path: impl Into<String>) -> Self {
        Self {
            root: PathBuf::from("/sys/fs/cgroup"),
            pod_path: pod_path.into(),
        }
    }

    /// Custom cgroup root, used by tests.
    pub fn with_root(root: PathBuf, pod_path: impl Into<String>) -> Self {
        Self {
            root,
            pod_path: pod_path.into(),
        }
    }

    fn controller_path(&self, controller: &str) -> PathBuf {
        self.root.join(controller).join(&self.pod_path)
    }
}

impl CgroupManager for FsCgroup {
    fn write(&self, controller: &str, file: &str, value: &str) -> Result<()> {
        let path = self.controller_path(controller).join(file);

        fs::write(&path, value).map_err(|err| {
            ChaosnetError::Driver(format!("cannot write {value} to {}: {err}", path.display()))
        })
    }

    fn exists(&self, controller: &str) -> Result<bool> {
        Ok(self.controller_path(controller).exists())
    }
}
