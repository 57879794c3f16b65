//! Wrapper functions for the events the stack reports.
//!
//! Each function covers one kind of event and gives it a fixed target so a
//! subscriber can filter on it. Everything else logs with plain `tracing`
//! macros at the call site.

use crate::{
    socket::{FlowKey, SocketId},
    stack::DropReason,
    utility::Endpoint,
};
use std::net::SocketAddrV4;
use tracing::{event, Level};

/// A socket came into existence or went away.
pub fn socket_event(id: SocketId, flow: &FlowKey, what: &str) {
    event!(target: "SOCKET", Level::INFO, socket = %id, flow = %flow, what);
}

/// A packet from the guest was dropped without any reply.
pub fn drop_event(reason: DropReason, detail: &str) {
    event!(target: "DROP", Level::DEBUG, reason = ?reason, detail);
}

/// A host forward or guest forward was added or removed.
pub fn forward_event(host: SocketAddrV4, guest: Endpoint, what: &str) {
    event!(target: "FORWARD", Level::INFO, host = %host, guest = %guest, what);
}

/// A reset or ICMP error was sent to the guest in answer to a packet.
pub fn reply_event(to: Endpoint, kind: &str) {
    event!(target: "REPLY", Level::DEBUG, to = %to, kind);
}
