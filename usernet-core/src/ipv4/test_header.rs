use super::{ipv4_parsing::Ipv4Header, Ipv4Address};

/// A UDP datagram header from the guest to the virtual host, for tests that
/// work on parsed headers. Adjust fields with struct update syntax.
pub fn udp_from_guest(payload_len: u16) -> Ipv4Header {
    let header = Ipv4Header::new(
        Ipv4Address::new([10, 0, 2, 15]),
        Ipv4Address::new([10, 0, 2, 2]),
        17,
        payload_len,
    )
    .expect("payload fits in a datagram");
    Ipv4Header {
        identification: 1337,
        ..header
    }
}
