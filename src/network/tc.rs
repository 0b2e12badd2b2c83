//! tc(8) driver used to build the qdisc tree and steer traffic through it.

use crate::error::{ChaosnetError, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// The queueing-discipline operations the injector needs. Implementations
/// must tolerate concurrent calls, the reconcilers add and delete filters
/// from their own tasks.
#[async_trait]
pub trait TrafficController: Send + Sync {
    async fn add_prio(
        &self,
        interfaces: &[String],
        parent: &str,
        handle: u32,
        bands: u32,
        priomap: [u32; 16],
    ) -> Result<()>;

    async fn add_cgroup_filter(&self, interfaces: &[String], parent: &str, handle: u32)
        -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    async fn add_filter(
        &self,
        interfaces: &[String],
        parent: &str,
        priority: u32,
        handle: u32,
        src_ip: Option<IpNet>,
        dst_ip: Option<IpNet>,
        src_port: u16,
        dst_port: u16,
        protocol: &str,
        flowid: &str,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    async fn add_netem(
        &self,
        interfaces: &[String],
        parent: &str,
        handle: u32,
        delay: Duration,
        jitter: Duration,
        drop: u8,
        corrupt: u8,
        duplicate: u8,
    ) -> Result<()>;

    async fn add_output_limit(
        &self,
        interfaces: &[String],
        parent: &str,
        handle: u32,
        bytes_per_sec: u64,
    ) -> Result<()>;

    async fn delete_filter(&self, interface: &str, priority: u32) -> Result<()>;

    async fn clear_qdisc(&self, interfaces: &[String]) -> Result<()>;
}

/// Drives the kernel through the tc binary. With `dry_run` set, commands are
/// logged instead of executed.
pub struct TcCommandDriver {
    dry_run: bool,
}

impl TcCommandDriver {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        if self.dry_run {
            info!("dry run: tc {}", args.join(" "));
            return Ok(());
        }

        debug!("running: tc {}", args.join(" "));

        let output = Command::new("tc")
            .args(&args)
            .output()
            .await
            .map_err(|err| ChaosnetError::Driver(format!("failed to execute tc: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ChaosnetError::Driver(format!(
                "tc {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(())
    }
}

fn qdisc_args(
    interface: &str,
    parent: &str,
    handle: u32,
    kind: &str,
    options: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        interface.into(),
    ];

    if parent == "root" {
        args.push("root".into());
    } else {
        args.push("parent".into());
        args.push(parent.into());
    }

    args.push("handle".into());
    args.push(format!("{handle}:"));
    args.push(kind.into());
    args.extend_from_slice(options);
    args
}

fn prio_options(bands: u32, priomap: [u32; 16]) -> Vec<String> {
    let mut options: Vec<String> = vec!["bands".into(), bands.to_string(), "priomap".into()];
    options.extend(priomap.iter().map(|band| band.to_string()));
    options
}

fn netem_options(
    delay: Duration,
    jitter: Duration,
    drop: u8,
    corrupt: u8,
    duplicate: u8,
) -> Vec<String> {
    let mut options: Vec<String> = vec![
        "delay".into(),
        format!("{}ms", delay.as_millis()),
        format!("{}ms", jitter.as_millis()),
    ];

    if drop > 0 {
        options.push("loss".into());
        options.push(format!("{drop}%"));
    }

    if corrupt > 0 {
        options.push("corrupt".into());
        options.push(format!("{corrupt}%"));
    }

    if duplicate > 0 {
        options.push("duplicate".into());
        options.push(format!("{duplicate}%"));
    }

    options
}

fn tbf_options(bytes_per_sec: u64) -> Vec<String> {
    // tc reads the bps unit as bytes per second; burst must hold at least
    // one full-size frame
    let burst = (bytes_per_sec / 10).max(1600);

    vec![
        "rate".into(),
        format!("{bytes_per_sec}bps"),
        "latency".into(),
        "50ms".into(),
        "burst".into(),
        burst.to_string(),
    ]
}

#[allow(clippy::too_many_arguments)]
fn filter_args(
    interface: &str,
    parent: &str,
    priority: u32,
    handle: u32,
    src_ip: Option<IpNet>,
    dst_ip: Option<IpNet>,
    src_port: u16,
    dst_port: u16,
    protocol: &str,
    flowid: &str,
) -> Vec<String> {
    let link_protocol = if protocol.eq_ignore_ascii_case("arp") {
        "arp"
    } else {
        "ip"
    };

    let mut args: Vec<String> = vec![
        "filter".into(),
        "add".into(),
        "dev".into(),
        interface.into(),
        "parent".into(),
        parent.into(),
        "protocol".into(),
        link_protocol.into(),
        "prio".into(),
        priority.to_string(),
    ];

    if handle != 0 {
        args.push("handle".into());
        args.push(format!("{handle}:"));
    }

    args.push("u32".into());

    let mut matches = 0;

    if let Some(ip) = src_ip {
        args.extend(["match".into(), "ip".into(), "src".into(), ip.to_string()]);
        matches += 1;
    }

    if let Some(ip) = dst_ip {
        args.extend(["match".into(), "ip".into(), "dst".into(), ip.to_string()]);
        matches += 1;
    }

    if src_port != 0 {
        args.extend([
            "match".into(),
            "ip".into(),
            "sport".into(),
            src_port.to_string(),
            "0xffff".into(),
        ]);
        matches += 1;
    }

    if dst_port != 0 {
        args.extend([
            "match".into(),
            "ip".into(),
            "dport".into(),
            dst_port.to_string(),
            "0xffff".into(),
        ]);
        matches += 1;
    }

    match protocol.to_ascii_lowercase().as_str() {
        "tcp" => {
            args.extend([
                "match".into(),
                "ip".into(),
                "protocol".into(),
                "6".into(),
                "0xff".into(),
            ]);
            matches += 1;
        }
        "udp" => {
            args.extend([
                "match".into(),
                "ip".into(),
                "protocol".into(),
                "17".into(),
                "0xff".into(),
            ]);
            matches += 1;
        }
        _ => {}
    }

    // u32 rejects a filter without any selector
    if matches == 0 {
        args.extend(["match".into(), "u32".into(), "0".into(), "0".into()]);
    }

    args.push("flowid".into());
    args.push(flowid.into());
    args
}

#[async_trait]
impl TrafficController for TcCommandDriver {
    async fn add_prio(
        &self,
        interfaces: &[String],
        parent: &str,
        handle: u32,
        bands: u32,
        priomap: [u32; 16],
    ) -> Result<()> {
        for interface in interfaces {
            self.run(qdisc_args(
                interface,
                parent,
                handle,
                "prio",
                &prio_options(bands, priomap),
            ))
            .await?;
        }

        Ok(())
    }

    async fn add_cgroup_filter(
        &self,
        interfaces: &[String],
        parent: &str,
        handle: u32,
    ) -> Result<()> {
        for interface in interfaces {
            self.run(vec![
                "filter".into(),
                "add".into(),
                "dev".into(),
                interface.clone(),
                "parent".into(),
                parent.into(),
                "handle".into(),
                format!("{handle}:"),
                "cgroup".into(),
            ])
            .await?;
        }

        Ok(())
    }

    async fn add_filter(
        &self,
        interfaces: &[String],
        parent: &str,
        priority: u32,
        handle: u32,
        src_ip: Option<IpNet>,
        dst_ip: Option<IpNet>,
        src_port: u16,
        dst_port: u16,
        protocol: &str,
        flowid: &str,
    ) -> Result<()> {
        for interface in interfaces {
            self.run(filter_args(
                interface, parent, priority, handle, src_ip, dst_ip, src_port, dst_port,
                protocol, flowid,
            ))
            .await?;
        }

        Ok(())
    }

    async fn add_netem(
        &self,
        interfaces: &[String],
        parent: &str,
        handle: u32,
        delay: Duration,
        jitter: Duration,
        drop: u8,
        corrupt: u8,
        duplicate: u8,
    ) -> Result<()> {
        for interface in interfaces {
            self.run(qdisc_args(
                interface,
                parent,
                handle,
                "netem",
                &netem_options(delay, jitter, drop, corrupt, duplicate),
            ))
            .await?;
        }

        Ok(())
    }

    async fn add_output_limit(
        &self,
        interfaces: &[String],
        parent: &str,
        handle: u32,
        bytes_per_sec: u64,
    ) -> Result<()> {
        for interface in interfaces {
            self.run(qdisc_args(
                interface,
                parent,
                handle,
                "tbf",
                &tbf_options(bytes_per_sec),
            ))
            .await?;
        }

        Ok(())
    }

    async fn delete_filter(&self, interface: &str, priority: u32) -> Result<()> {
        self.run(vec![
            "filter".into(),
            "del".into(),
            "dev".into(),
            interface.into(),
            "parent".into(),
            "1:0".into(),
            "pref".into(),
            priority.to_string(),
        ])
        .await
    }

    async fn clear_qdisc(&self, interfaces: &[String]) -> Result<()> {
        for interface in interfaces {
            let args: Vec<String> = vec![
                "qdisc".into(),
                "del".into(),
                "dev".into(),
                interface.clone(),
                "root".into(),
            ];

            if self.dry_run {
                info!("dry run: tc {}", args.join(" "));
                continue;
            }

            debug!("running: tc {}", args.join(" "));

            let output = Command::new("tc")
                .args(&args)
                .output()
                .await
                .map_err(|err| ChaosnetError::Driver(format!("failed to execute tc: {err}")))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);

                // no custom qdisc installed is a fine state to clear
                if !stderr.contains("No such file or directory") {
                    return Err(ChaosnetError::Driver(format!(
                        "tc {} failed: {}",
                        args.join(" "),
                        stderr.trim()
                    )));
                }
            }
        }

        Ok(())
    }
}
