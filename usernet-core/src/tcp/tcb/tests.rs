//! Connection walkthroughs against a control block in isolation. The guest
//! side is played by hand-built segments.

use super::*;
use crate::{
    ipv4::Ipv4Address,
    tcp::tcp_parsing::TcpHeader,
};

const GUEST: Ipv4Address = Ipv4Address::new([10, 0, 2, 15]);
const REMOTE: Ipv4Address = Ipv4Address::new([93, 184, 216, 34]);
const GUEST_PORT: u16 = 0xcafe;
const REMOTE_PORT: u16 = 80;

const GUEST_ISS: u32 = 100;
const OUR_ISS: u32 = 300;

/// A segment from the guest, assembled flag by flag.
#[derive(Clone, Copy)]
struct Guest(TcpHeader);

fn guest(seq: u32) -> Guest {
    Guest(TcpHeader::new(GUEST_PORT, REMOTE_PORT, seq, 0, Control::default(), u16::MAX))
}

impl Guest {
    fn ack(mut self, ack: u32) -> Self {
        self.0.ctl.insert(Control::ACK);
        self.0.ack = ack;
        self
    }

    fn with(mut self, flag: Control) -> Self {
        self.0.ctl.insert(flag);
        self
    }

    fn syn(self) -> Self {
        self.with(Control::SYN)
    }

    fn fin(self) -> Self {
        self.with(Control::FIN)
    }

    fn rst(self) -> Self {
        self.with(Control::RST)
    }

    fn psh(self) -> Self {
        self.with(Control::PSH)
    }

    fn wnd(mut self, wnd: u16) -> Self {
        self.0.wnd = wnd;
        self
    }
}

/// Puts the segment on the wire and reads it back, as the stack would see it.
fn arrive(tcb: &mut Tcb, bufs: &mut SocketBuffers, segment: Guest, payload: &[u8]) -> anyhow::Result<Arrival> {
    let payload = Chain::new(payload);
    let mut wire = payload.clone();
    wire.prepend(segment.0.to_bytes(GUEST, REMOTE, &payload)?);
    let header = TcpHeader::from_chain(&wire, GUEST, REMOTE)?;
    Ok(tcb.segment_arrives(&header, payload, bufs))
}

fn config() -> TcbConfig {
    TcbConfig {
        mss: 1460,
        keepalive: false,
    }
}

/// Drives a guest-initiated handshake to ESTABLISHED.
fn established(bufs: &mut SocketBuffers) -> anyhow::Result<Tcb> {
    // Based on RFC 9293 section 3.5 Figure 6, with the guest as peer A:
    //
    //     Guest                                                 Stack
    // 1.  CLOSED                                                LISTEN
    // 2.  SYN-SENT    --> <SEQ=100><CTL=SYN>                --> SYN-RECEIVED
    // 3.  ESTABLISHED <-- <SEQ=300><ACK=101><CTL=SYN,ACK>   <-- SYN-RECEIVED
    // 4.  ESTABLISHED --> <SEQ=101><ACK=301><CTL=ACK>       --> ESTABLISHED

    // 2
    let mut tcb = Tcb::passive_open(GUEST_ISS, u16::MAX, Some(1400), OUR_ISS, config());
    assert_eq!(tcb.state(), State::SynReceived);

    // 3
    let syn_ack = tcb.output(bufs);
    assert_eq!(syn_ack.len(), 1);
    assert_eq!(syn_ack[0].ctl, Control::SYN_ACK);
    assert_eq!(syn_ack[0].seq, OUR_ISS);
    assert_eq!(syn_ack[0].ack, GUEST_ISS + 1);
    assert_eq!(syn_ack[0].mss, Some(1460));

    // 4
    let arrival = arrive(&mut tcb, bufs, guest(GUEST_ISS + 1).ack(OUR_ISS + 1), b"")?;
    assert_eq!(arrival.disposition, Disposition::Accepted);
    assert_eq!(tcb.state(), State::Established);
    assert_eq!(tcb.snd().una, OUR_ISS + 1);
    assert_eq!(tcb.maxseg(), 1400);
    Ok(tcb)
}

#[test]
fn passive_handshake() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = established(&mut bufs)?;
    assert_eq!(tcb.timers().rexmt, 0);
    assert!(tcb.output(&bufs).is_empty());
    Ok(())
}

#[test]
fn active_handshake() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = Tcb::active_open(500, config());
    let syn = tcb.output(&bufs);
    assert_eq!(syn.len(), 1);
    assert_eq!(syn[0].ctl, Control::SYN);
    assert_eq!(syn[0].seq, 500);
    assert!(tcb.timers().rexmt > 0);

    let builder = guest(900).syn().ack(501);
    let arrival = arrive(&mut tcb, &mut bufs, builder, b"")?;
    assert_eq!(arrival.disposition, Disposition::Accepted);
    assert_eq!(tcb.state(), State::Established);

    let ack = tcb.output(&bufs);
    assert_eq!(ack.len(), 1);
    assert_eq!(ack[0].ctl, Control::ACK);
    assert_eq!(ack[0].seq, 501);
    assert_eq!(ack[0].ack, 901);
    Ok(())
}

#[test]
fn active_open_refused() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = Tcb::active_open(500, config());
    tcb.output(&bufs);
    let arrival = arrive(&mut tcb, &mut bufs, guest(0).rst().ack(501), b"")?;
    assert_eq!(arrival.disposition, Disposition::Reset);
    assert_eq!(tcb.state(), State::Closed);
    Ok(())
}

#[test]
fn passive_close() -> anyhow::Result<()> {
    // Based on RFC 9293 section 3.6 Figure 12, with the guest closing first:
    //
    //     Guest                                                 Stack
    // 1.  ESTABLISHED                                           ESTABLISHED
    // 2.  FIN-WAIT-1  --> <SEQ=101><ACK=301><CTL=FIN,ACK>   --> CLOSE-WAIT
    // 3.  FIN-WAIT-2  <-- <SEQ=301><ACK=102><CTL=ACK>       <-- CLOSE-WAIT
    // 4.  (Close)
    //     TIME-WAIT   <-- <SEQ=301><ACK=102><CTL=FIN,ACK>   <-- LAST-ACK
    // 5.  TIME-WAIT   --> <SEQ=102><ACK=302><CTL=ACK>       --> CLOSED

    let mut bufs = SocketBuffers::default();
    let mut tcb = established(&mut bufs)?;

    // 2
    let arrival = arrive(&mut tcb, &mut bufs, guest(101).fin().ack(301), b"")?;
    assert!(arrival.fin);
    assert_eq!(tcb.state(), State::CloseWait);

    // 3
    let ack = tcb.output(&bufs);
    assert_eq!(ack.len(), 1);
    assert_eq!(ack[0].ctl, Control::ACK);
    assert_eq!(ack[0].ack, 102);

    // 4
    assert!(!tcb.close_local());
    assert_eq!(tcb.state(), State::LastAck);
    let fin = tcb.output(&bufs);
    assert_eq!(fin.len(), 1);
    assert_eq!(fin[0].ctl, Control::FIN_ACK);
    assert_eq!(fin[0].seq, 301);

    // 5
    let arrival = arrive(&mut tcb, &mut bufs, guest(102).ack(302), b"")?;
    assert_eq!(arrival.disposition, Disposition::Closed);
    assert_eq!(tcb.state(), State::Closed);
    Ok(())
}

#[test]
fn active_close_through_time_wait() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = established(&mut bufs)?;

    assert!(!tcb.close_local());
    assert_eq!(tcb.state(), State::FinWait1);
    let fin = tcb.output(&bufs);
    assert_eq!(fin[0].ctl, Control::FIN_ACK);

    arrive(&mut tcb, &mut bufs, guest(101).ack(302), b"")?;
    assert_eq!(tcb.state(), State::FinWait2);

    let arrival = arrive(&mut tcb, &mut bufs, guest(101).fin().ack(302), b"")?;
    assert!(arrival.fin);
    assert_eq!(tcb.state(), State::TimeWait);
    assert_eq!(tcb.output(&bufs)[0].ack, 102);

    for _ in 1..2 * timers::TCPTV_MSL {
        assert_eq!(tcb.slow_tick(), TimerOutcome::Idle);
    }
    assert_eq!(tcb.slow_tick(), TimerOutcome::Closed);
    Ok(())
}

#[test]
fn in_order_data_is_delayed_acked() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = established(&mut bufs)?;

    let arrival = arrive(&mut tcb, &mut bufs, guest(101).ack(301).psh(), b"hello")?;
    assert_eq!(arrival.delivered, Chain::new(b"hello"));
    assert!(tcb.flags().delayed_ack);
    assert!(tcb.output(&bufs).is_empty());

    assert!(tcb.fast_tick());
    let ack = tcb.output(&bufs);
    assert_eq!(ack.len(), 1);
    assert_eq!(ack[0].ack, 106);
    Ok(())
}

#[test]
fn out_of_order_data_waits_for_the_gap() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = established(&mut bufs)?;

    let arrival = arrive(&mut tcb, &mut bufs, guest(106).ack(301), b"world")?;
    assert!(arrival.delivered.is_empty());
    assert_eq!(tcb.queued_bytes(), 5);
    let dup = tcb.output(&bufs);
    assert_eq!(dup[0].ack, 101);

    let arrival = arrive(&mut tcb, &mut bufs, guest(101).ack(301), b"hello")?;
    assert_eq!(arrival.delivered, Chain::new(b"helloworld"));
    assert_eq!(tcb.rcv().nxt, 111);
    assert_eq!(tcb.queued_bytes(), 0);
    Ok(())
}

#[test]
fn data_to_guest_is_acked_and_released() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = established(&mut bufs)?;

    bufs.to_guest.append(b"response");
    let data = tcb.output(&bufs);
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].seq, 301);
    assert_eq!(data[0].payload, Chain::new(b"response"));
    assert!(data[0].ctl.psh());
    assert!(tcb.timers().rexmt > 0);
    // Held until acknowledged
    assert_eq!(bufs.to_guest.len(), 8);

    arrive(&mut tcb, &mut bufs, guest(101).ack(309), b"")?;
    assert!(bufs.to_guest.is_empty());
    assert_eq!(tcb.timers().rexmt, 0);
    Ok(())
}

#[test]
fn large_writes_are_segmented() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = established(&mut bufs)?;
    // Open the congestion window past one segment
    tcb.cwnd = TCP_MAXWIN;

    bufs.to_guest.append(&[0xab; 3000]);
    let segments = tcb.output(&bufs);
    let lens: Vec<_> = segments.iter().map(|s| s.payload.len()).collect();
    assert_eq!(lens, [1400, 1400, 200]);
    assert_eq!(segments[1].seq, 301 + 1400);
    Ok(())
}

#[test]
fn third_duplicate_ack_resends_at_once() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = established(&mut bufs)?;
    tcb.cwnd = TCP_MAXWIN;

    bufs.to_guest.append(&[0xcd; 4200]);
    assert_eq!(tcb.output(&bufs).len(), 3);
    let sent = tcb.snd.nxt;
    assert_eq!(sent, 301 + 4200);

    // The first segment went missing; the guest keeps asking for it
    for _ in 0..2 {
        let arrival = arrive(&mut tcb, &mut bufs, guest(101).ack(301), b"")?;
        assert!(arrival.retransmitted.is_empty());
    }
    let arrival = arrive(&mut tcb, &mut bufs, guest(101).ack(301), b"")?;
    assert_eq!(arrival.disposition, Disposition::Discarded);
    assert_eq!(arrival.retransmitted.len(), 1);
    assert_eq!(arrival.retransmitted[0].seq, 301);
    assert_eq!(arrival.retransmitted[0].payload.len(), 1400);
    assert_eq!(tcb.snd.nxt, sent);
    assert_eq!(tcb.ssthresh, 23 * 1400);
    assert_eq!(tcb.cwnd, tcb.ssthresh + 3 * 1400);

    // Each further duplicate inflates the window by a segment
    let arrival = arrive(&mut tcb, &mut bufs, guest(101).ack(301), b"")?;
    assert!(arrival.retransmitted.is_empty());
    assert_eq!(tcb.cwnd, tcb.ssthresh + 4 * 1400);

    // The hole is filled: the window falls back to the threshold, then opens
    arrive(&mut tcb, &mut bufs, guest(101).ack(sent), b"")?;
    assert_eq!(tcb.cwnd, tcb.ssthresh + 1400);
    assert!(bufs.to_guest.is_empty());
    Ok(())
}

#[test]
fn retransmits_with_backoff_then_drops() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = established(&mut bufs)?;

    bufs.to_guest.append(b"lost");
    tcb.output(&bufs);

    let mut retransmissions = vec![];
    let mut ticks = 0;
    let mut last = 0;
    loop {
        ticks += 1;
        match tcb.slow_tick() {
            TimerOutcome::Output => {
                let segments = tcb.output(&bufs);
                assert_eq!(segments[0].seq, 301);
                assert_eq!(segments[0].payload, Chain::new(b"lost"));
                retransmissions.push(ticks - last);
                last = ticks;
            }
            TimerOutcome::Dropped => break,
            TimerOutcome::Idle => {}
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(retransmissions.len(), timers::TCP_MAXRXTSHIFT);
    assert!(retransmissions.windows(2).all(|w| w[0] <= w[1]));
    assert!(retransmissions.iter().all(|&gap| gap <= timers::TCPTV_REXMTMAX));

    assert_eq!(tcb.state(), State::Closed);
    let reset = tcb.output(&bufs);
    assert_eq!(reset[0].ctl, Control::RST_ACK);
    Ok(())
}

#[test]
fn zero_window_arms_persist() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = established(&mut bufs)?;
    arrive(&mut tcb, &mut bufs, guest(101).ack(301).wnd(0), b"")?;
    assert_eq!(tcb.snd().wnd, 0);

    bufs.to_guest.append(b"blocked");
    assert!(tcb.output(&bufs).is_empty());
    assert!(tcb.timers().persist >= timers::TCPTV_PERSMIN);

    while tcb.slow_tick() != TimerOutcome::Output {}
    let probe = tcb.output(&bufs);
    assert_eq!(probe.len(), 1);
    assert_eq!(probe[0].payload.len(), 1);
    assert_eq!(probe[0].seq, 301);
    Ok(())
}

#[test]
fn inexact_reset_gets_challenge_ack() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = established(&mut bufs)?;

    let arrival = arrive(&mut tcb, &mut bufs, guest(105).rst(), b"")?;
    assert_eq!(arrival.disposition, Disposition::Discarded);
    assert_eq!(tcb.state(), State::Established);
    let challenge = tcb.output(&bufs);
    assert_eq!(challenge[0].ctl, Control::ACK);
    assert_eq!(challenge[0].ack, 101);

    let arrival = arrive(&mut tcb, &mut bufs, guest(101).rst(), b"")?;
    assert_eq!(arrival.disposition, Disposition::Reset);
    assert_eq!(tcb.state(), State::Closed);
    Ok(())
}

#[test]
fn in_window_syn_gets_challenge_ack() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = established(&mut bufs)?;
    let arrival = arrive(&mut tcb, &mut bufs, guest(150).syn(), b"")?;
    assert_eq!(arrival.disposition, Disposition::Discarded);
    assert_eq!(tcb.state(), State::Established);
    assert!(tcb.flags().ack_now);
    Ok(())
}

#[test]
fn segment_outside_window_is_acked_and_dropped() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = established(&mut bufs)?;
    let arrival = arrive(&mut tcb, &mut bufs, guest(101 + 70_000).ack(301), b"far")?;
    assert_eq!(arrival.disposition, Disposition::Discarded);
    assert!(arrival.delivered.is_empty());
    assert_eq!(tcb.output(&bufs)[0].ack, 101);
    Ok(())
}

#[test]
fn unacceptable_ack_in_syn_received_resets() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = Tcb::passive_open(GUEST_ISS, u16::MAX, None, OUR_ISS, config());
    tcb.output(&bufs);
    let arrival = arrive(&mut tcb, &mut bufs, guest(101).ack(OUR_ISS + 50), b"")?;
    assert_eq!(arrival.disposition, Disposition::DropWithReset);
    Ok(())
}

#[test]
fn lost_syn_ack_is_resent_for_retransmitted_syn() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let mut tcb = Tcb::passive_open(GUEST_ISS, u16::MAX, None, OUR_ISS, config());
    tcb.output(&bufs);
    arrive(&mut tcb, &mut bufs, guest(GUEST_ISS).syn(), b"")?;
    let again = tcb.output(&bufs);
    assert_eq!(again[0].ctl, Control::SYN_ACK);
    assert_eq!(again[0].seq, OUR_ISS);
    Ok(())
}

#[test]
fn sequence_numbers_wrap() -> anyhow::Result<()> {
    let mut bufs = SocketBuffers::default();
    let guest_iss = u32::MAX - 2;
    let mut tcb = Tcb::passive_open(guest_iss, u16::MAX, None, u32::MAX, config());
    tcb.output(&bufs);
    arrive(&mut tcb, &mut bufs, guest(u32::MAX - 1).ack(0), b"")?;
    assert_eq!(tcb.state(), State::Established);

    let arrival = arrive(&mut tcb, &mut bufs, guest(u32::MAX - 1).ack(0), b"wrap")?;
    assert_eq!(arrival.delivered, Chain::new(b"wrap"));
    assert_eq!(tcb.rcv().nxt, 2);
    Ok(())
}

#[test]
fn unanswered_syn_ack_times_out() {
    let bufs = SocketBuffers::default();
    let mut tcb = Tcb::passive_open(GUEST_ISS, u16::MAX, None, OUR_ISS, config());
    tcb.output(&bufs);
    let mut ticks = 0;
    loop {
        ticks += 1;
        match tcb.slow_tick() {
            TimerOutcome::Output => {
                tcb.output(&bufs);
            }
            TimerOutcome::Dropped => break,
            TimerOutcome::Idle => {}
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(ticks <= timers::TCPTV_KEEP_INIT + 1);
}
