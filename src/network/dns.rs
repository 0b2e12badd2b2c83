use crate::error::{ChaosnetError, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::IpAddr;
use tokio::net::lookup_host;

/// Turns a host expression into the networks it covers.
#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpNet>>;
}

/// Accepts CIDRs and IP literals as-is and resolves everything else through
/// the system resolver.
pub struct SystemDnsClient;

#[async_trait]
impl DnsClient for SystemDnsClient {
    async fn resolve(&self, host: &str) -> Result<Vec<IpNet>> {
        if let Ok(net) = host.parse::<IpNet>() {
            return Ok(vec![net]);
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![IpNet::from(ip)]);
        }

        let addrs = lookup_host((host, 0u16))
            .await
            .map_err(|err| ChaosnetError::Lookup(format!("cannot resolve {host}: {err}")))?;

        let mut nets = Vec::new();
        for addr in addrs {
            let net = IpNet::from(addr.ip());
            if !nets.contains(&net) {
                nets.push(net);
            }
        }

        if nets.is_empty() {
            return Err(ChaosnetError::Lookup(format!("no address found for {host}")));
        }

        Ok(nets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cidrs_pass_through() {
        let nets = SystemDnsClient.resolve("10.0.0.0/8").await.unwrap();
        assert_eq!(nets, vec!["10.0.0.0/8".parse::<IpNet>().unwrap()]);
    }

    #[tokio::test]
    async fn literals_become_host_networks() {
        let nets = SystemDnsClient.resolve("192.168.1.10").await.unwrap();
        assert_eq!(nets, vec!["192.168.1.10/32".parse::<IpNet>().unwrap()]);

        let nets = SystemDnsClient.resolve("fd00::1").await.unwrap();
        assert_eq!(nets, vec!["fd00::1/128".parse::<IpNet>().unwrap()]);
    }
}
