use crate::error::{ChaosnetError, Result};
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::os::fd::AsFd;

/// Scoped access to the target's network namespace. Callers bracket every
/// region doing netlink, tc or socket work with enter and exit.
pub trait NetworkNamespace: Send + Sync {
    fn enter(&self) -> Result<()>;

    fn exit(&self) -> Result<()>;
}

/// Network namespace of another process, entered through setns(2) on its
/// /proc handle. The caller's own namespace is captured at construction so
/// exit can restore it.
pub struct ProcNetns {
    target: File,
    origin: File,
}

impl ProcNetns {
    pub fn open(pid: u32) -> Result<Self> {
        let target = File::open(format!("/proc/{pid}/ns/net")).map_err(|err| {
            ChaosnetError::Namespace(format!(
                "cannot open network namespace of pid {pid}: {err}"
            ))
        })?;

        let origin = File::open("/proc/self/ns/net").map_err(|err| {
            ChaosnetError::Namespace(format!("cannot open own network namespace: {err}"))
        })?;

        Ok(Self { target, origin })
    }
}

impl NetworkNamespace for ProcNetns {
    fn enter(&self) -> Result<()> {
        setns(self.target.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|err| {
            ChaosnetError::Namespace(format!("cannot enter target network namespace: {err}"))
        })
    }

    fn exit(&self) -> Result<()> {
        setns(self.origin.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|err| {
            ChaosnetError::Namespace(format!("cannot restore own network namespace: {err}"))
        })
    }
}

/// Used when the target shares the injector's namespace, node-level
/// disruptions for instance.
pub struct HostNetns;

impl NetworkNamespace for HostNetns {
    fn enter(&self) -> Result<()> {
        Ok(())
    }

    fn exit(&self) -> Result<()> {
        Ok(())
    }
}
