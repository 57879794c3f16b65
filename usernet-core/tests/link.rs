mod common;

use common::*;
use std::net::SocketAddrV4;
use usernet_core::{DropReason, Endpoint, InputOutcome, Protocol};

#[test]
fn answers_arp_for_the_virtual_host() -> anyhow::Result<()> {
    let mut stack = stack();
    assert_eq!(stack.input(&arp_request(HOST_IP)), InputOutcome::Processed);

    let frames = stack.callbacks_mut().take_frames();
    assert_eq!(frames.len(), 1);
    let reply = &frames[0];
    assert_eq!(&reply[..6], &GUEST_MAC);
    assert_eq!(&reply[12..14], &[0x08, 0x06]);
    let arp = &reply[14..];
    // Operation: reply
    assert_eq!(&arp[6..8], &[0, 2]);
    assert_eq!(&arp[8..14], &host_mac());
    assert_eq!(&arp[14..18], &HOST_IP);
    assert_eq!(&arp[18..24], &GUEST_MAC);
    assert_eq!(&arp[24..28], &GUEST_IP);
    assert_eq!(stack.stats().link.arp_requests_answered, 1);
    Ok(())
}

#[test]
fn ignores_arp_for_other_addresses() {
    let mut stack = stack();
    assert_eq!(
        stack.input(&arp_request([10, 0, 2, 77])),
        InputOutcome::Dropped(DropReason::NotForUs)
    );
    assert!(stack.callbacks().frames.is_empty());
}

#[test]
fn rejects_unknown_ether_types_and_runts() {
    let mut stack = stack();
    assert_eq!(
        stack.input(&ethernet(0x86dd, &[0; 40])),
        InputOutcome::Dropped(DropReason::UnsupportedEtherType)
    );
    assert_eq!(
        stack.input(&[0xff; 9]),
        InputOutcome::Dropped(DropReason::Malformed)
    );
    assert_eq!(stack.stats().link.frames_in, 2);
}

#[test]
fn unknown_guest_is_asked_for_first() -> anyhow::Result<()> {
    let mut stack = stack();
    let sender: SocketAddrV4 = "192.0.2.9:4000".parse()?;

    // A forwarded datagram toward a guest the stack has never heard from
    stack.add_hostfwd(Protocol::Udp, "0.0.0.0:5555".parse()?, Endpoint::new(address(GUEST_IP), 7))?;
    for socket in stack.callbacks_mut().datagrams.values_mut() {
        socket.inbound.push_back((b"hi".to_vec(), sender));
    }
    stack.poll(10);

    let frames = stack.callbacks_mut().take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..6], &[0xff; 6]);
    assert_eq!(&frames[0][12..14], &[0x08, 0x06]);
    // Request, asking for the guest
    assert_eq!(&frames[0][14 + 6..14 + 8], &[0, 1]);
    assert_eq!(&frames[0][14 + 24..14 + 28], &GUEST_IP);
    assert_eq!(stack.stats().link.arp_misses, 1);
    assert_eq!(stack.mbuf_outstanding(), 0);
    Ok(())
}

#[test]
fn burst_to_unknown_guest_asks_once() -> anyhow::Result<()> {
    let mut stack = stack();
    let sender: SocketAddrV4 = "192.0.2.9:4000".parse()?;
    stack.add_hostfwd(Protocol::Udp, "0.0.0.0:5555".parse()?, Endpoint::new(address(GUEST_IP), 7))?;
    for socket in stack.callbacks_mut().datagrams.values_mut() {
        for n in 0..5u8 {
            socket.inbound.push_back((vec![n], sender));
        }
    }
    stack.poll(10);

    let frames = stack.callbacks_mut().take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][12..14], &[0x08, 0x06]);
    assert_eq!(stack.stats().link.arp_misses, 5);
    assert_eq!(stack.mbuf_outstanding(), 0);

    // A later drain may ask again
    for socket in stack.callbacks_mut().datagrams.values_mut() {
        socket.inbound.push_back((b"again".to_vec(), sender));
    }
    stack.poll(20);
    assert_eq!(stack.callbacks_mut().take_frames().len(), 1);
    Ok(())
}

#[test]
fn echo_to_the_virtual_host_is_answered_locally() -> anyhow::Result<()> {
    let mut stack = stack();
    let request = echo_request(HOST_IP, 0x1234, 7, b"are you there")?;
    assert_eq!(stack.input(&request), InputOutcome::Processed);

    let frames = stack.callbacks_mut().take_frames();
    let (ip, icmp) = parse_ipv4(&frames[0])?;
    assert_eq!(ip.source, HOST_IP);
    assert_eq!(ip.destination, GUEST_IP);
    assert_eq!(icmp[0], 0);
    assert_eq!(&icmp[4..6], &0x1234u16.to_be_bytes());
    assert_eq!(&icmp[6..8], &7u16.to_be_bytes());
    assert_eq!(&icmp[8..], b"are you there");
    assert_eq!(internet_checksum(&icmp), 0);
    assert_eq!(stack.socket_count(), 0);
    Ok(())
}

#[test]
fn echo_without_host_support_is_unreachable() -> anyhow::Result<()> {
    let mut stack = stack();
    let request = echo_request(REMOTE_IP, 1, 1, b"ping")?;
    assert_eq!(stack.input(&request), InputOutcome::Replied);

    let frames = stack.callbacks_mut().take_frames();
    let (ip, icmp) = parse_ipv4(&frames[0])?;
    assert_eq!(ip.source, HOST_IP);
    assert_eq!(&icmp[..2], &[3, 1]);
    assert_eq!(stack.socket_count(), 0);
    Ok(())
}
