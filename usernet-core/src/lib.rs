//! A user-mode network stack for virtual machines, a library for giving a
//! guest a working network without any privileges on the host.
//!
//! # Uses
//!
//! - Emulators and sandboxes can hand the guest's Ethernet frames to a
//!   [`Stack`] and get back frames for the guest. The guest sees a small
//!   private network with a gateway and a DNS server; its TCP connections
//!   and UDP datagrams leave the host through ordinary sockets.
//! - Hosts can forward ports in either direction: host listeners that lead
//!   to guest services, and virtual addresses inside the guest network that
//!   lead to host services.
//!
//! The stack terminates the guest's TCP itself. Every guest connection is
//! answered by a control block inside the stack and relayed byte by byte
//! over a host socket, so only the stack needs to know TCP.
//!
//! # Organization
//! - [`Stack`] owns all state for one virtual link and is driven by
//!   [`Stack::input`], [`Stack::poll`], and [`Stack::timer_expired`]
//! - [`Callbacks`] is everything the stack needs from its host: frame
//!   delivery, timers, and non-blocking sockets
//! - [`StackConfig`] describes the virtual network and the stack's limits
//! - [`mbuf`], [`interface`], [`arp`], [`ipv4`], [`tcp`], [`udp`], and
//!   [`icmp`] hold the layers, from buffers and output queues up to the
//!   transports
//!
//! # Threading
//!
//! A stack is single threaded. Everything runs on the caller's thread from
//! inside the three entry points, and no call blocks.

mod logging;

pub mod arp;
pub mod callbacks;
pub use callbacks::{Callbacks, ConnectStatus, HostHandle, TimerKind};

pub mod checksum;

pub mod config;
pub use config::{ConfigError, StackConfig};

pub mod ethernet;
pub use ethernet::MacAddress;

pub mod icmp;
pub mod interface;

pub mod ipv4;
pub use ipv4::Ipv4Address;

pub mod mbuf;

pub mod socket;
pub use socket::{FlowKey, Protocol};

pub mod stack;
pub use stack::{DropReason, InputOutcome, Stack, StackError};

pub mod stats;
pub use stats::Stats;

pub mod tcp;
pub mod udp;

pub mod utility;
pub use utility::Endpoint;
