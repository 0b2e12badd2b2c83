use crate::error::{ChaosnetError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::net::IpAddr;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct NetlinkLink {
    pub name: String,
    pub tx_queue_len: u32,
}

#[derive(Debug, Clone)]
pub struct DefaultRoute {
    pub gateway: IpAddr,
    pub link: String,
}

impl fmt::Display for DefaultRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "via {} dev {}", self.gateway, self.link)
    }
}

/// Link and route reads plus the one link write the injector needs.
#[async_trait]
pub trait NetlinkAdapter: Send + Sync {
    async fn link_list(&self) -> Result<Vec<NetlinkLink>>;

    async fn default_routes(&self) -> Result<Vec<DefaultRoute>>;

    async fn set_tx_queue_len(&self, interface: &str, qlen: u32) -> Result<()>;
}

/// Adapter backed by the ip binary and its JSON output.
#[derive(Default)]
pub struct IpCommandAdapter;

impl IpCommandAdapter {
    pub fn new() -> Self {
        Self
    }
}

async fn run_ip(args: &[&str]) -> Result<Vec<u8>> {
    debug!("running: ip {}", args.join(" "));

    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|err| ChaosnetError::Driver(format!("failed to execute ip: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ChaosnetError::Driver(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(output.stdout)
}

#[derive(Deserialize)]
struct LinkEntry {
    ifname: String,
    #[serde(default)]
    txqlen: u32,
}

#[derive(Deserialize)]
struct RouteEntry {
    #[serde(default)]
    gateway: Option<IpAddr>,
    #[serde(default)]
    dev: Option<String>,
}

fn parse_links(output: &[u8]) -> Result<Vec<NetlinkLink>> {
    let entries: Vec<LinkEntry> = serde_json::from_slice(output)
        .map_err(|err| ChaosnetError::Driver(format!("cannot parse ip link output: {err}")))?;

    Ok(entries
        .into_iter()
        .map(|entry| NetlinkLink {
            name: entry.ifname,
            tx_queue_len: entry.txqlen,
        })
        .collect())
}

fn parse_routes(output: &[u8]) -> Result<Vec<DefaultRoute>> {
    let entries: Vec<RouteEntry> = serde_json::from_slice(output)
        .map_err(|err| ChaosnetError::Driver(format!("cannot parse ip route output: {err}")))?;

    Ok(entries
        .into_iter()
        .filter_map(|entry| match (entry.gateway, entry.dev) {
            (Some(gateway), Some(link)) => Some(DefaultRoute { gateway, link }),
            _ => None,
        })
        .collect())
}

#[async_trait]
impl NetlinkAdapter for IpCommandAdapter {
    async fn link_list(&self) -> Result<Vec<NetlinkLink>> {
        let output = run_ip(&["-json", "link", "show"]).await?;
        parse_links(&output)
    }

    async fn default_routes(&self) -> Result<Vec<DefaultRoute>> {
        let output = run_ip(&["-json", "route", "show", "default"]).await?;
        parse_routes(&output)
    }

    async fn set_tx_queue_len(&self, interface: &str, qlen: u32) -> Result<()> {
        run_ip(&["link", "set", "dev", interface, "txqueuelen", &qlen.to_string()]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_link_names_and_queue_lengths() {
        let output = br#"[
            {"ifname": "lo", "txqlen": 1000, "mtu": 65536},
            {"ifname": "eth0", "mtu": 1500}
        ]"#;

        let links = parse_links(output).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].name, "lo");
        assert_eq!(links[0].tx_queue_len, 1000);
        assert_eq!(links[1].name, "eth0");
        assert_eq!(links[1].tx_queue_len, 0);
    }

    #[test]
    fn parses_default_routes_and_skips_incomplete_entries() {
        let output = br#"[
            {"dst": "default", "gateway": "10.0.0.1", "dev": "eth0"},
            {"dst": "default", "dev": "eth1"}
        ]"#;

        let routes = parse_routes(output).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].gateway, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(routes[0].link, "eth0");
    }
}
