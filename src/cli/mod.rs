pub mod commands;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chaosnet")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Network fault injector for chaos engineering on Kubernetes", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Inject network-layer faults into the target")]
    NetworkDisruption(NetworkDisruptionArgs),
}

#[derive(Args)]
pub struct NetworkDisruptionArgs {
    #[arg(long, default_value_t = 0, help = "Percentage of packets to corrupt")]
    pub corrupt: u8,

    #[arg(long, default_value_t = 0, help = "Percentage of packets to drop")]
    pub drop: u8,

    #[arg(long, default_value_t = 0, help = "Percentage of packets to duplicate")]
    pub duplicate: u8,

    #[arg(long, default_value_t = 0, help = "Packet delay in milliseconds")]
    pub delay: u32,

    #[arg(long, default_value_t = 0, help = "Delay jitter as a percentage of the delay")]
    pub delay_jitter: u8,

    #[arg(long, default_value_t = 0, help = "Outgoing bandwidth limit in bytes per second")]
    pub bandwidth_limit: u64,

    #[arg(long, help = "Host to disrupt, formatted as host;port;protocol;flow")]
    pub hosts: Vec<String>,

    #[arg(long, help = "Host to keep undisturbed, formatted as host;port;protocol;flow")]
    pub allowed_hosts: Vec<String>,

    #[arg(long, help = "Cluster service to disrupt, formatted as name;namespace")]
    pub services: Vec<String>,

    #[arg(long, default_value = "pod", help = "Disruption level (pod or node)")]
    pub level: String,

    #[arg(long, help = "Treat the disruption as applied on pod init")]
    pub on_init: bool,

    #[arg(long, help = "Log tc commands instead of running them")]
    pub dry_run: bool,

    #[arg(
        long,
        default_value_t = 0,
        help = "PID owning the target network namespace (0 targets the current one)"
    )]
    pub target_pid: u32,

    #[arg(long, default_value = "", help = "Pod cgroup path relative to the cgroup root")]
    pub cgroup_path: String,
}
