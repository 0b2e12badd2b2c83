//! Declarative network disruption model, validation and the CLI argument
//! codec used to hand a disruption to the injector binary.

use crate::error::{ChaosnetError, Result};
use crate::k8s::ClusterClient;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Disruptions applied to outgoing packets.
pub const FLOW_EGRESS: &str = "egress";
/// Disruptions applied to incoming packets.
pub const FLOW_INGRESS: &str = "ingress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisruptionLevel {
    Pod,
    Node,
}

/// A network disruption: which traffic to disturb and how.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DisruptionSpec {
    pub hosts: Vec<HostSpec>,
    pub allowed_hosts: Vec<HostSpec>,
    pub services: Vec<ServiceRef>,
    /// Percentage of packets to drop.
    pub drop: u8,
    /// Percentage of packets to duplicate.
    pub duplicate: u8,
    /// Percentage of packets to corrupt.
    pub corrupt: u8,
    /// Delay applied to packets, in milliseconds.
    pub delay: u32,
    /// Delay jitter as a percentage of the delay.
    pub delay_jitter: u8,
    /// Outgoing bandwidth limit in bytes per second.
    pub bandwidth_limit: u64,
    #[serde(rename = "port", skip_serializing_if = "Option::is_none")]
    pub deprecated_port: Option<u16>,
    #[serde(rename = "flow", skip_serializing_if = "String::is_empty")]
    pub deprecated_flow: String,
}

/// A traffic selector: empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSpec {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub flow: String,
}

/// Reference to a cluster service whose traffic should be disrupted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub name: String,
    pub namespace: String,
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl DisruptionSpec {
    /// Checks every invariant and aggregates the violations into a single
    /// error. When a cluster client is given, referenced services must exist.
    pub async fn validate(&self, cluster: Option<&dyn ClusterClient>) -> Result<()> {
        let mut violations = Vec::new();

        if self.drop == 0
            && self.duplicate == 0
            && self.corrupt == 0
            && self.delay == 0
            && self.bandwidth_limit == 0
        {
            violations.push(
                "at least one of drop, duplicate, corrupt, delay or bandwidthLimit must be set"
                    .to_string(),
            );
        }

        for (field, value) in [
            ("drop", self.drop),
            ("duplicate", self.duplicate),
            ("corrupt", self.corrupt),
            ("delayJitter", self.delay_jitter),
        ] {
            if value > 100 {
                violations.push(format!("{field} must be between 0 and 100, got {value}"));
            }
        }

        if self.delay > 60_000 {
            violations.push(format!(
                "delay must be between 0 and 60000 milliseconds, got {}",
                self.delay
            ));
        }

        for host in self.hosts.iter().chain(self.allowed_hosts.iter()) {
            host.check(&mut violations);
        }

        for service in &self.services {
            if service.name.is_empty() || service.namespace.is_empty() {
                violations.push(format!(
                    "service name and namespace must both be set, got \"{service}\""
                ));
            } else if let Some(cluster) = cluster {
                if let Err(err) = cluster.get_service(&service.namespace, &service.name).await {
                    violations.push(format!("cannot resolve service {service}: {err}"));
                }
            }
        }

        if self.deprecated_port.is_some() {
            violations.push(
                "the port field at the disruption level is deprecated; set it on hosts instead"
                    .to_string(),
            );
        }

        if !self.deprecated_flow.is_empty() {
            violations.push(
                "the flow field at the disruption level is deprecated; set it on hosts instead"
                    .to_string(),
            );
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ChaosnetError::InvalidSpec(violations))
        }
    }

    /// Renders the disruption as injector binary arguments; the reverse of
    /// [`HostSpec::parse_args`] and [`ServiceRef::parse_args`].
    pub fn generate_args(&self) -> Vec<String> {
        let mut args = vec![
            "network-disruption".to_string(),
            "--corrupt".to_string(),
            self.corrupt.to_string(),
            "--drop".to_string(),
            self.drop.to_string(),
            "--duplicate".to_string(),
            self.duplicate.to_string(),
            "--delay".to_string(),
            self.delay.to_string(),
            "--delay-jitter".to_string(),
            self.delay_jitter.to_string(),
            "--bandwidth-limit".to_string(),
            self.bandwidth_limit.to_string(),
        ];

        for host in &self.hosts {
            args.push("--hosts".to_string());
            args.push(host.to_arg());
        }

        for host in &self.allowed_hosts {
            args.push("--allowed-hosts".to_string());
            args.push(host.to_arg());
        }

        for service in &self.services {
            args.push("--services".to_string());
            args.push(format!("{};{}", service.name, service.namespace));
        }

        args
    }
}

impl HostSpec {
    fn check(&self, violations: &mut Vec<String>) {
        if !self.flow.is_empty() && self.host.is_empty() && self.port == 0 {
            violations.push(format!(
                "host or port must be set when the flow is set on host \"{}\"",
                self.to_arg()
            ));
        }

        if !matches!(self.protocol.as_str(), "" | "tcp" | "udp") {
            violations.push(format!(
                "protocol must be tcp or udp, got \"{}\"",
                self.protocol
            ));
        }

        if !matches!(self.flow.as_str(), "" | FLOW_EGRESS | FLOW_INGRESS) {
            violations.push(format!(
                "flow must be {FLOW_EGRESS} or {FLOW_INGRESS}, got \"{}\"",
                self.flow
            ));
        }
    }

    pub fn to_arg(&self) -> String {
        format!(
            "{};{};{};{}",
            self.host, self.port, self.protocol, self.flow
        )
    }

    /// Parses `host;port;protocol;flow` tuples; trailing fields are optional.
    pub fn parse_args(hosts: &[String]) -> Result<Vec<HostSpec>> {
        let mut parsed = Vec::with_capacity(hosts.len());

        for host in hosts {
            let fields: Vec<&str> = host.splitn(4, ';').collect();

            let port = match fields.get(1) {
                Some(port) if !port.is_empty() => port.parse::<u16>().map_err(|err| {
                    ChaosnetError::InvalidSpec(vec![format!(
                        "unexpected port parameter in \"{host}\": {err}"
                    )])
                })?,
                _ => 0,
            };

            parsed.push(HostSpec {
                host: fields[0].to_string(),
                port,
                protocol: fields.get(2).copied().unwrap_or_default().to_string(),
                flow: fields.get(3).copied().unwrap_or_default().to_string(),
            });
        }

        Ok(parsed)
    }
}

impl ServiceRef {
    /// Parses `name;namespace` pairs; both fields are required.
    pub fn parse_args(services: &[String]) -> Result<Vec<ServiceRef>> {
        let mut parsed = Vec::with_capacity(services.len());

        for service in services {
            let fields: Vec<&str> = service.split(';').collect();
            if fields.len() != 2 {
                return Err(ChaosnetError::InvalidSpec(vec![format!(
                    "unexpected service format: \"{service}\""
                )]));
            }

            parsed.push(ServiceRef {
                name: fields[0].to_string(),
                namespace: fields[1].to_string(),
            });
        }

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{service_port, test_service, FakeCluster};

    fn drop_spec() -> DisruptionSpec {
        DisruptionSpec {
            drop: 100,
            ..DisruptionSpec::default()
        }
    }

    #[tokio::test]
    async fn validate_rejects_noop_disruption() {
        let err = DisruptionSpec::default().validate(None).await.unwrap_err();

        match err {
            ChaosnetError::InvalidSpec(violations) => assert_eq!(violations.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn validate_counts_one_violation_per_rule() {
        let spec = DisruptionSpec {
            hosts: vec![HostSpec {
                flow: FLOW_EGRESS.to_string(),
                ..HostSpec::default()
            }],
            deprecated_port: Some(8080),
            deprecated_flow: FLOW_EGRESS.to_string(),
            ..drop_spec()
        };

        let err = spec.validate(None).await.unwrap_err();

        match err {
            ChaosnetError::InvalidSpec(violations) => assert_eq!(violations.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn validate_checks_service_existence() {
        let cluster = FakeCluster::new();
        cluster.add_service(
            "ns",
            test_service("known", "ns", Some("10.0.0.5"), &[], vec![service_port(80, 8080, "TCP")]),
        );

        let known = DisruptionSpec {
            services: vec![ServiceRef {
                name: "known".to_string(),
                namespace: "ns".to_string(),
            }],
            ..drop_spec()
        };
        assert!(known.validate(Some(&cluster)).await.is_ok());

        let unknown = DisruptionSpec {
            services: vec![ServiceRef {
                name: "missing".to_string(),
                namespace: "ns".to_string(),
            }],
            ..drop_spec()
        };
        let err = unknown.validate(Some(&cluster)).await.unwrap_err();

        match err {
            ChaosnetError::InvalidSpec(violations) => {
                assert_eq!(violations.len(), 1);
                assert!(violations[0].contains("ns/missing"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn host_args_round_trip() {
        let input = vec![
            "example.com;443;tcp;egress".to_string(),
            "10.0.0.1;;;".to_string(),
            "host;80;;".to_string(),
        ];

        let parsed = HostSpec::parse_args(&input).unwrap();
        assert_eq!(
            parsed[0],
            HostSpec {
                host: "example.com".to_string(),
                port: 443,
                protocol: "tcp".to_string(),
                flow: "egress".to_string(),
            }
        );
        assert_eq!(
            parsed[1],
            HostSpec {
                host: "10.0.0.1".to_string(),
                port: 0,
                protocol: String::new(),
                flow: String::new(),
            }
        );
        assert_eq!(parsed[2].port, 80);

        let reencoded: Vec<String> = parsed.iter().map(HostSpec::to_arg).collect();
        let reparsed = HostSpec::parse_args(&reencoded).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn host_args_reject_bad_port() {
        let err = HostSpec::parse_args(&["example.com;not-a-port;;".to_string()]).unwrap_err();
        assert!(err.to_string().contains("not-a-port"));
    }

    #[test]
    fn service_args_require_both_fields() {
        let parsed = ServiceRef::parse_args(&["svc;ns".to_string()]).unwrap();
        assert_eq!(parsed[0].name, "svc");
        assert_eq!(parsed[0].namespace, "ns");

        assert!(ServiceRef::parse_args(&["svc".to_string()]).is_err());
        assert!(ServiceRef::parse_args(&["svc;ns;extra".to_string()]).is_err());
    }

    #[test]
    fn generate_args_orders_flags_then_selectors() {
        let spec = DisruptionSpec {
            hosts: vec![HostSpec {
                host: "example.com".to_string(),
                port: 443,
                protocol: "tcp".to_string(),
                flow: "egress".to_string(),
            }],
            allowed_hosts: vec![HostSpec {
                host: "10.0.0.1".to_string(),
                ..HostSpec::default()
            }],
            services: vec![ServiceRef {
                name: "svc".to_string(),
                namespace: "ns".to_string(),
            }],
            drop: 5,
            delay: 1000,
            ..DisruptionSpec::default()
        };

        assert_eq!(
            spec.generate_args(),
            vec![
                "network-disruption",
                "--corrupt",
                "0",
                "--drop",
                "5",
                "--duplicate",
                "0",
                "--delay",
                "1000",
                "--delay-jitter",
                "0",
                "--bandwidth-limit",
                "0",
                "--hosts",
                "example.com;443;tcp;egress",
                "--allowed-hosts",
                "10.0.0.1;0;;",
                "--services",
                "svc;ns",
            ]
        );
    }
}
