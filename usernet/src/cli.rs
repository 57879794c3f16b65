//! Parses the command line arguments and sets up logging.
//!
//! Basic usage, with QEMU connecting to the default address:
//!
//! ```cargo run -p usernet -- --log --hostfwd tcp::2222-:22```
//!
//! ```qemu-system-x86_64 -netdev stream,id=n0,addr.type=inet,addr.host=127.0.0.1,addr.port=5555 ...```

use clap::Parser;
use std::{
    fs::{create_dir_all, OpenOptions},
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    str::FromStr,
    sync::Arc,
};
use thiserror::Error as ThisError;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use usernet_core::{Endpoint, Ipv4Address, Protocol, StackConfig};

/// Stores the different command line arguments.
#[derive(Parser, Debug)]
#[command(version, about = "A user-mode network for one virtual machine")]
pub struct Args {
    /// Write JSON logs to ./logs instead of plain logs to stderr
    #[arg(short, long)]
    pub log: bool,
    /// More detail: once for debug, twice for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Where to wait for the emulator's stream connection
    #[arg(long, default_value = "127.0.0.1:5555")]
    pub listen: SocketAddr,
    /// The virtual network
    #[arg(long, default_value = "10.0.2.0/24")]
    pub net: Network,
    /// The virtual gateway, the network's second address by default
    #[arg(long)]
    pub host: Option<Ipv4Addr>,
    /// The guest's address, the network's fifteenth by default
    #[arg(long)]
    pub dhcp_start: Option<Ipv4Addr>,
    /// The virtual DNS server, the network's third address by default
    #[arg(long)]
    pub dns: Option<Ipv4Addr>,
    /// A real resolver for queries sent to the virtual DNS server
    #[arg(long)]
    pub dns_upstream: Option<SocketAddrV4>,
    #[arg(long, default_value_t = 1500)]
    pub mtu: u16,
    #[arg(long)]
    pub hostname: Option<String>,
    /// Keep the guest off the outside network
    #[arg(long)]
    pub restrict: bool,
    /// Leave FTP and IRC control traffic untouched
    #[arg(long)]
    pub no_emu: bool,
    #[arg(long)]
    pub keepalive: bool,
    /// Refuse connections to the gateway instead of reaching host loopback
    #[arg(long)]
    pub disable_host_loopback: bool,
    /// `[tcp|udp]:[hostaddr]:hostport-[guestaddr]:guestport`, repeatable
    #[arg(long = "hostfwd")]
    pub hostfwds: Vec<HostForward>,
    /// `tcp:virtaddr:port-hostaddr:port`, repeatable
    #[arg(long = "guestfwd")]
    pub guestfwds: Vec<GuestForward>,
}

impl Args {
    /// The stack configuration these arguments describe. It is validated when
    /// the stack is built.
    pub fn stack_config(&self) -> StackConfig {
        let network = Ipv4Address::from(self.net.address);
        let nth = |n: u32| Ipv4Address::from(network.to_u32().wrapping_add(n));
        let pick = |chosen: Option<Ipv4Addr>, n: u32| chosen.map_or(nth(n), Ipv4Address::from);
        StackConfig {
            restricted: self.restrict,
            network,
            netmask: self.net.netmask(),
            host: pick(self.host, 2),
            dhcp_start: pick(self.dhcp_start, 15),
            nameserver: pick(self.dns, 3),
            dns_upstream: self.dns_upstream,
            mtu: self.mtu,
            mru: self.mtu,
            hostname: self.hostname.clone(),
            disable_host_loopback: self.disable_host_loopback,
            enable_emu: !self.no_emu,
            keepalive: self.keepalive,
            ..Default::default()
        }
    }
}

/// An IPv4 network in prefix notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Network {
    pub fn netmask(&self) -> Ipv4Address {
        Ipv4Address::from(u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0))
    }
}

impl FromStr for Network {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = s.split_once('/').ok_or(RuleError::MissingPrefix)?;
        let address = address
            .parse::<Ipv4Addr>()
            .map_err(|_| RuleError::Address(address.to_string()))?;
        let prefix = prefix
            .parse::<u8>()
            .ok()
            .filter(|prefix| (1..=30).contains(prefix))
            .ok_or(RuleError::Prefix(prefix.to_string()))?;
        Ok(Self { address, prefix })
    }
}

/// A host port whose connections or datagrams are relayed to the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostForward {
    pub protocol: Protocol,
    pub host: SocketAddrV4,
    /// An unspecified address means the guest's own
    pub guest: Endpoint,
}

impl FromStr for HostForward {
    type Err = RuleError;

    fn from_str(rule: &str) -> Result<Self, Self::Err> {
        let (protocol, rest) = split_protocol(rule)?;
        let (host, guest) = rest.split_once('-').ok_or(RuleError::MissingSeparator)?;
        let (host_address, host_port) = parse_endpoint(host)?;
        let (guest_address, guest_port) = parse_endpoint(guest)?;
        Ok(Self {
            protocol,
            host: SocketAddrV4::new(host_address, host_port),
            guest: Endpoint::new(guest_address.into(), guest_port),
        })
    }
}

/// A virtual address inside the guest network that leads to a host service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestForward {
    pub virtual_endpoint: Endpoint,
    pub target: SocketAddrV4,
}

impl FromStr for GuestForward {
    type Err = RuleError;

    fn from_str(rule: &str) -> Result<Self, Self::Err> {
        let (protocol, rest) = split_protocol(rule)?;
        if protocol != Protocol::Tcp {
            return Err(RuleError::UnsupportedProtocol(protocol));
        }
        let (virtual_endpoint, target) = rest.split_once('-').ok_or(RuleError::MissingSeparator)?;
        let (virtual_address, virtual_port) = parse_endpoint(virtual_endpoint)?;
        let (target_address, target_port) = parse_endpoint(target)?;
        Ok(Self {
            virtual_endpoint: Endpoint::new(virtual_address.into(), virtual_port),
            target: SocketAddrV4::new(target_address, target_port),
        })
    }
}

/// Takes an optional `tcp:` or `udp:` off the front of a rule.
fn split_protocol(rule: &str) -> Result<(Protocol, &str), RuleError> {
    match rule.split_once(':') {
        Some(("tcp", rest)) => Ok((Protocol::Tcp, rest)),
        Some(("udp", rest)) => Ok((Protocol::Udp, rest)),
        Some(("", rest)) => Ok((Protocol::Tcp, rest)),
        Some((other, _)) if other.parse::<Ipv4Addr>().is_err() => {
            Err(RuleError::UnknownProtocol(other.to_string()))
        }
        _ => Ok((Protocol::Tcp, rule)),
    }
}

/// Parses `[address]:port`, where a missing address is unspecified.
fn parse_endpoint(s: &str) -> Result<(Ipv4Addr, u16), RuleError> {
    let (address, port) = s.rsplit_once(':').ok_or(RuleError::MissingPort(s.to_string()))?;
    let address = if address.is_empty() {
        Ipv4Addr::UNSPECIFIED
    } else {
        address
            .parse()
            .map_err(|_| RuleError::Address(address.to_string()))?
    };
    let port = port.parse().map_err(|_| RuleError::Port(port.to_string()))?;
    Ok((address, port))
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("Expected a network like 10.0.2.0/24")]
    MissingPrefix,
    #[error("The prefix length {0} must be between 1 and 30")]
    Prefix(String),
    #[error("Expected a '-' between the two ends of the rule")]
    MissingSeparator,
    #[error("Expected a port after '{0}'")]
    MissingPort(String),
    #[error("'{0}' is not an IPv4 address")]
    Address(String),
    #[error("'{0}' is not a port number")]
    Port(String),
    #[error("Unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error("{0} cannot be forwarded this way")]
    UnsupportedProtocol(Protocol),
}

/// Initializes the tracing subscriber. Only should be called once at startup.
/// With `log`, events are written as JSON to a timestamped file in ./logs;
/// otherwise they go to stderr.
pub fn initialize_logging(log: bool, verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    if log {
        let main_path = "./logs";
        create_dir_all(main_path)?;
        let file_path = format!(
            "{}/usernet-{}.log",
            main_path,
            chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
        );
        let file = OpenOptions::new().append(true).create(true).open(file_path)?;
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(Arc::new(file))
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(io::stderr)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}
