pub mod cgroup;
pub mod dns;
pub mod netlink;
pub mod netns;
pub mod tc;

pub use cgroup::{CgroupManager, FsCgroup};
pub use dns::{DnsClient, SystemDnsClient};
pub use netlink::{DefaultRoute, IpCommandAdapter, NetlinkAdapter, NetlinkLink};
pub use netns::{HostNetns, NetworkNamespace, ProcNetns};
pub use tc::{TcCommandDriver, TrafficController};
