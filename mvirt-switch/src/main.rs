//! mvirt-switch daemon: bridges host interfaces to VM socket pairs.

use std::os::fd::{AsRawFd, RawFd};
use std::process::ExitStatus;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::builder::RangedU64ValueParser;
use clap::{Parser, ValueEnum};
use mvirt_switch::config::{
    DEFAULT_CAPTURE_BUFFER_SIZE, DEFAULT_LOCAL_BUFFER_SIZE, DEFAULT_MEMBERSHIP_INTERVAL,
    DEFAULT_POLL_TIMEOUT, DEFAULT_THROTTLE_WINDOW, MIN_BUFFER_SIZE,
};
use mvirt_switch::{InterfaceRegistry, MacAddr, RelayPolicy, Switch, SwitchConfig, VmAttachment};
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use tokio::process::{Child, Command};
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// `IFACE` or `IFACE=MAC`
#[derive(Debug, Clone, PartialEq, Eq)]
struct PortSpec {
    interface: String,
    mac: Option<MacAddr>,
}

impl FromStr for PortSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (interface, mac) = match s.split_once('=') {
            Some((iface, mac)) => {
                let mac = mac.parse::<MacAddr>().map_err(|e| format!("invalid MAC {mac:?}: {e}"))?;
                (iface, Some(mac))
            }
            None => (s, None),
        };
        if interface.is_empty() {
            return Err("interface name is empty".to_string());
        }
        Ok(PortSpec {
            interface: interface.to_string(),
            mac,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RelayPolicyArg {
    /// One VM datagram per readiness event
    OnePerEvent,
    /// Drain the VM socket on each readiness event
    Drain,
}

impl From<RelayPolicyArg> for RelayPolicy {
    fn from(arg: RelayPolicyArg) -> Self {
        match arg {
            RelayPolicyArg::OnePerEvent => RelayPolicy::OnePerEvent,
            RelayPolicyArg::Drain => RelayPolicy::DrainReported,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "mvirt-switch")]
#[command(about = "Bridge host network interfaces to VM socket pairs")]
struct Args {
    /// Host interface (bridge or NIC) and optional guest MAC; repeatable.
    /// A random locally administered MAC is used when omitted.
    #[arg(long = "port", value_name = "IFACE[=MAC]", required = true)]
    ports: Vec<PortSpec>,

    #[arg(long, value_enum, default_value_t = RelayPolicyArg::OnePerEvent)]
    relay_policy: RelayPolicyArg,

    /// Socket pair buffer size in bytes
    #[arg(long, default_value_t = DEFAULT_LOCAL_BUFFER_SIZE, value_parser = buffer_size())]
    local_buffer_size: usize,

    /// Capture buffer size in bytes (also the snap length)
    #[arg(long, default_value_t = DEFAULT_CAPTURE_BUFFER_SIZE, value_parser = buffer_size())]
    capture_buffer_size: usize,

    #[arg(
        long,
        default_value_t = DEFAULT_POLL_TIMEOUT.as_millis() as u64,
        value_parser = clap::value_parser!(u64).range(1..=u16::MAX as u64)
    )]
    poll_timeout_ms: u64,

    #[arg(
        long,
        default_value_t = DEFAULT_MEMBERSHIP_INTERVAL.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    membership_interval_secs: u64,

    #[arg(long, default_value_t = DEFAULT_THROTTLE_WINDOW.as_secs())]
    throttle_window_secs: u64,

    /// Only deliver frames addressed to the guest MAC
    #[arg(long)]
    no_broadcast: bool,

    /// VMM command to spawn. `{fdN}` and `{macN}` are replaced with the
    /// N-th port's descriptor and MAC.
    #[arg(last = true, value_name = "CMD")]
    exec: Vec<String>,
}

impl Args {
    fn config(&self) -> SwitchConfig {
        SwitchConfig {
            local_buffer_size: self.local_buffer_size,
            capture_buffer_size: self.capture_buffer_size,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            relay_policy: self.relay_policy.into(),
            throttle_window: Duration::from_secs(self.throttle_window_secs),
            membership_interval: Duration::from_secs(self.membership_interval_secs),
            accept_broadcast: !self.no_broadcast,
        }
    }
}

/// Buffers must hold at least one full Ethernet frame.
fn buffer_size() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::<usize>::new().range(MIN_BUFFER_SIZE as u64..)
}

/// Replace `{fdN}` / `{macN}` placeholders in the VMM command line.
fn substitute(args: &[String], ports: &[(RawFd, MacAddr)]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            ports.iter().enumerate().fold(arg.clone(), |acc, (i, (fd, mac))| {
                acc.replace(&format!("{{fd{i}}}"), &fd.to_string())
                    .replace(&format!("{{mac{i}}}"), &mac.to_string())
            })
        })
        .collect()
}

fn spawn_vmm(command: &[String], attachments: &[VmAttachment]) -> Result<Child> {
    let ports: Vec<(RawFd, MacAddr)> = attachments.iter().map(|a| (a.fd.as_raw_fd(), a.mac)).collect();
    let argv = substitute(command, &ports);
    let Some((program, rest)) = argv.split_first() else {
        bail!("empty VMM command");
    };

    // The VMM inherits the VM ends by number
    for attachment in attachments {
        fcntl(&attachment.fd, FcntlArg::F_SETFD(FdFlag::empty()))
            .with_context(|| format!("clear FD_CLOEXEC on fd {}", attachment.fd.as_raw_fd()))?;
    }

    let child = Command::new(program)
        .args(rest)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn {program}"))?;
    info!(program = %program, pid = child.id(), "VMM started");
    Ok(child)
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = args.config();

    info!("mvirt-switch starting...");

    let registry = InterfaceRegistry::system().context("Failed to open interface control")?;
    let mut switch = Switch::new(registry, config.clone());

    let mut attachments = Vec::with_capacity(args.ports.len());
    for spec in &args.ports {
        let mac = spec.mac.unwrap_or_else(MacAddr::random);
        let attachment = switch
            .add_port(&spec.interface, mac)
            .with_context(|| format!("Failed to open port on {}", spec.interface))?;
        info!(
            host_interface = %attachment.host_interface,
            mac = %attachment.mac,
            fd = attachment.fd.as_raw_fd(),
            "VM socket ready"
        );
        attachments.push(attachment);
    }

    switch.start().context("Failed to start switch")?;

    let mut child = if args.exec.is_empty() {
        None
    } else {
        Some(spawn_vmm(&args.exec, &attachments)?)
    };
    if child.is_some() {
        // The VMM holds its own copies now
        attachments.clear();
    }

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    let mut membership = tokio::time::interval(config.membership_interval);
    membership.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sigint.recv() => { info!("Received SIGINT"); break; }
            _ = sigterm.recv() => { info!("Received SIGTERM"); break; }
            status = wait_child(&mut child) => {
                match status {
                    Ok(status) => info!(%status, "VMM exited"),
                    Err(e) => error!(error = %e, "Failed to wait for VMM"),
                }
                child = None;
                break;
            }
            _ = membership.tick() => {
                switch.ensure_bridge_membership();
            }
        }
    }

    info!("Shutting down...");
    let timeout = config.poll_timeout * 2 + Duration::from_secs(1);
    if !switch.cancel_and_join(timeout) {
        warn!(timeout_ms = timeout.as_millis() as u64, "Switch thread did not stop in time");
    }
    drop(child);
    drop(attachments);

    info!("mvirt-switch stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_spec_parsing() {
        let spec: PortSpec = "br0=52:54:00:12:34:56".parse().unwrap();
        assert_eq!(spec.interface, "br0");
        assert_eq!(spec.mac, Some(MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56])));

        let spec: PortSpec = "eth1".parse().unwrap();
        assert_eq!(spec.mac, None);

        assert!("br0=zz".parse::<PortSpec>().is_err());
        assert!("=52:54:00:12:34:56".parse::<PortSpec>().is_err());
    }

    #[test]
    fn placeholders_substituted() {
        let mac = MacAddr([0x52, 0x54, 0x00, 0, 0, 1]);
        let args: Vec<String> = ["vmm", "--net", "fd={fd0},mac={mac0}", "{fd1}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = substitute(&args, &[(7, mac), (9, mac)]);
        assert_eq!(out, vec!["vmm", "--net", "fd=7,mac=52:54:00:00:00:01", "9"]);
    }

    #[test]
    fn cli_builds_config() {
        let args = Args::try_parse_from([
            "mvirt-switch",
            "--port",
            "br0",
            "--port",
            "eth1=02:00:00:00:00:01",
            "--relay-policy",
            "drain",
            "--poll-timeout-ms",
            "250",
            "--no-broadcast",
            "--",
            "vmm",
            "--net",
            "{fd0}",
        ])
        .unwrap();

        assert_eq!(args.ports.len(), 2);
        assert_eq!(args.exec, vec!["vmm", "--net", "{fd0}"]);

        let config = args.config();
        assert_eq!(config.relay_policy, RelayPolicy::DrainReported);
        assert_eq!(config.poll_timeout, Duration::from_millis(250));
        assert!(!config.accept_broadcast);
        assert_eq!(config.local_buffer_size, DEFAULT_LOCAL_BUFFER_SIZE);
    }

    #[test]
    fn cli_rejects_degenerate_tunables() {
        let parse = |flag: &str, value: &str| {
            Args::try_parse_from(["mvirt-switch", "--port", "eth0", flag, value])
        };
        assert!(parse("--capture-buffer-size", "0").is_err());
        assert!(parse("--capture-buffer-size", "100").is_err());
        assert!(parse("--local-buffer-size", "0").is_err());
        assert!(parse("--poll-timeout-ms", "0").is_err());
        assert!(parse("--poll-timeout-ms", "70000").is_err());
        assert!(parse("--membership-interval-secs", "0").is_err());

        let args = parse("--capture-buffer-size", "2048").unwrap();
        assert_eq!(args.config().capture_buffer_size, MIN_BUFFER_SIZE);
    }

    #[test]
    fn cli_requires_a_port() {
        assert!(Args::try_parse_from(["mvirt-switch"]).is_err());
    }
}
