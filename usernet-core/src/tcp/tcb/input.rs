//! Segment arrival, after RFC 9293 section 3.10.7 with the acceptance tests
//! of RFC 5961 for resets and stray SYNs.

use super::{
    timers::{TCPTV_KEEP_IDLE, TCPTV_MSL, TCP_MAXIDLE},
    Incoming, OutSegment, State, Tcb, TCP_MAXCWND,
};
use crate::{
    mbuf::Chain,
    socket::sbuf::SocketBuffers,
    tcp::{
        seq::{in_window, seq_geq, seq_gt, seq_leq, seq_lt},
        tcp_parsing::TcpHeader,
    },
};

/// Duplicate acknowledgments that trigger a fast retransmit
const TCP_REXMT_THRESH: u32 = 3;

/// What became of an arriving segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed. The owner should run output.
    Accepted,
    /// Discarded. An acknowledgment may still be owed, so the owner should
    /// run output.
    Discarded,
    /// Discard and answer with a reset derived from the segment itself.
    DropWithReset,
    /// The guest reset the connection.
    Reset,
    /// The connection is finished and the control block can be destroyed.
    Closed,
}

/// The result of processing one segment
#[derive(Debug, Clone)]
pub struct Arrival {
    pub disposition: Disposition,
    /// In-order data for the host
    pub delivered: Chain,
    /// The guest's FIN was consumed; the host should see end of stream once
    /// `delivered` has been written.
    pub fin: bool,
    /// Segments sent immediately by a fast retransmit
    pub retransmitted: Vec<OutSegment>,
}

impl Arrival {
    fn new(disposition: Disposition) -> Self {
        Self {
            disposition,
            delivered: Chain::default(),
            fin: false,
            retransmitted: vec![],
        }
    }
}

impl Tcb {
    /// Processes a segment from the guest. `payload` is the segment text
    /// after the TCP header.
    pub fn segment_arrives(
        &mut self,
        seg: &TcpHeader,
        payload: Chain,
        bufs: &mut SocketBuffers,
    ) -> Arrival {
        self.idle = 0;
        if self.state.is_synchronized() {
            self.timers.keep = TCPTV_KEEP_IDLE;
        }
        match self.state {
            State::Closed | State::Listen => Arrival::new(Disposition::DropWithReset),
            State::SynSent => self.arrives_syn_sent(seg, payload, bufs),
            _ => self.arrives_synchronized(seg, payload, bufs),
        }
    }

    /// 3.10.7.3
    fn arrives_syn_sent(
        &mut self,
        seg: &TcpHeader,
        mut payload: Chain,
        bufs: &mut SocketBuffers,
    ) -> Arrival {
        // First
        if seg.ctl.ack() && (seq_leq(seg.ack, self.snd.iss) || seq_gt(seg.ack, self.snd.max)) {
            return Arrival::new(Disposition::DropWithReset);
        }

        // Second
        if seg.ctl.rst() {
            if seg.ctl.ack() {
                self.state = State::Closed;
                return Arrival::new(Disposition::Reset);
            }
            return Arrival::new(Disposition::Discarded);
        }

        // Fourth
        if !seg.ctl.syn() {
            return Arrival::new(Disposition::Discarded);
        }
        if seg.ctl.ack() {
            self.snd.una = seg.ack;
            if seq_lt(self.snd.nxt, self.snd.una) {
                self.snd.nxt = self.snd.una;
            }
            self.timers.rexmt = 0;
        }
        self.rcv.irs = seg.seq;
        self.rcv.nxt = seg.seq.wrapping_add(1);
        self.rcv.adv = self.rcv.nxt;
        self.flags.ack_now = true;
        self.negotiate_mss(seg.mss);

        if seg.ctl.ack() && seq_gt(self.snd.una, self.snd.iss) {
            self.state = State::Established;
            self.timers.keep = TCPTV_KEEP_IDLE;
            if self.rtt_ticks > 0 {
                self.rtt.sample(self.rtt_ticks);
                self.rtt_ticks = 0;
            }
            tracing::trace!("SYN-SENT -> ESTABLISHED");
        } else {
            // Simultaneous open. Our SYN goes out again with an ACK.
            self.state = State::SynReceived;
            self.snd.nxt = self.snd.una;
        }

        // Text arriving with the SYN is trimmed to the window and processed
        // with the rest of the data.
        let seq = seg.seq.wrapping_add(1);
        let window = self.receive_window(bufs) as usize;
        let mut fin = seg.ctl.fin();
        if payload.len() > window {
            payload.truncate(window);
            fin = false;
        }
        self.snd.wl1 = seq.wrapping_sub(1);
        self.snd.wl2 = seg.ack;
        self.snd.wnd = seg.wnd as u32;
        self.max_sndwnd = self.max_sndwnd.max(self.snd.wnd);

        let mut arrival = Arrival::new(Disposition::Accepted);
        self.receive_text(seq, payload, fin, &mut arrival);
        arrival
    }

    /// 3.10.7.4, shared by every state from SYN-RECEIVED on
    fn arrives_synchronized(
        &mut self,
        seg: &TcpHeader,
        mut payload: Chain,
        bufs: &mut SocketBuffers,
    ) -> Arrival {
        let window = self.receive_window(bufs);

        // Resets are checked against the exact next sequence number before
        // anything is trimmed. An in-window reset that is not exact gets a
        // challenge acknowledgment.
        if seg.ctl.rst() {
            if seg.seq == self.rcv.nxt {
                return self.reset_received();
            }
            if in_window(self.rcv.nxt, seg.seq, window.max(1)) {
                tracing::debug!(seq = seg.seq, expected = self.rcv.nxt, "challenge ACK for reset");
                self.flags.ack_now = true;
            }
            return Arrival::new(Disposition::Discarded);
        }

        // First: sequence number acceptability
        let mut syn = seg.ctl.syn();
        let mut fin = seg.ctl.fin();
        let seg_len = payload.len() as u32 + syn as u32 + fin as u32;
        let acceptable = match (seg_len, window) {
            (0, 0) => seg.seq == self.rcv.nxt,
            (0, _) => in_window(self.rcv.nxt, seg.seq, window),
            (_, 0) => false,
            (_, _) => {
                in_window(self.rcv.nxt, seg.seq, window)
                    || in_window(self.rcv.nxt, seg.seq.wrapping_add(seg_len - 1), window)
            }
        };
        if !acceptable {
            // A retransmitted SYN means our SYN,ACK was lost. Send it again.
            if syn && self.state == State::SynReceived && seg.seq == self.rcv.irs {
                self.snd.nxt = self.snd.una;
            }
            self.flags.ack_now = true;
            return Arrival::new(Disposition::Discarded);
        }

        // Trim anything already received off the front
        let mut seq = seg.seq;
        let mut duplicate = self.rcv.nxt.wrapping_sub(seq);
        if seq_lt(seq, self.rcv.nxt) {
            if syn {
                syn = false;
                seq = seq.wrapping_add(1);
                duplicate -= 1;
            }
            let duplicate = duplicate as usize;
            if duplicate >= payload.len() {
                if fin && duplicate == payload.len() {
                    // Only the FIN is new
                } else {
                    fin = false;
                    self.flags.ack_now = true;
                }
            }
            let duplicate = duplicate.min(payload.len());
            payload.remove_front(duplicate);
            seq = seq.wrapping_add(duplicate as u32);
        }

        // And anything past the right edge of the window
        let right_edge = self.rcv.nxt.wrapping_add(window);
        let end = seq.wrapping_add(payload.len() as u32);
        if seq_gt(end, right_edge) {
            let excess = end.wrapping_sub(right_edge) as usize;
            payload.truncate(payload.len().saturating_sub(excess));
            fin = false;
            self.flags.ack_now = true;
        }

        // Fourth: a SYN inside the window is answered with a challenge
        // acknowledgment and otherwise ignored
        if syn {
            tracing::debug!(seq, "challenge ACK for SYN");
            self.flags.ack_now = true;
            return Arrival::new(Disposition::Discarded);
        }

        // Fifth
        if !seg.ctl.ack() {
            return Arrival::new(Disposition::Discarded);
        }

        let mut syn_acked = false;
        if self.state == State::SynReceived {
            if !(seq_lt(self.snd.una, seg.ack) && seq_leq(seg.ack, self.snd.max)) {
                return Arrival::new(Disposition::DropWithReset);
            }
            self.state = State::Established;
            self.timers.keep = TCPTV_KEEP_IDLE;
            syn_acked = true;
            self.snd.wl1 = seq.wrapping_sub(1);
            tracing::trace!("SYN-RECEIVED -> ESTABLISHED");
        }

        let mut arrival = Arrival::new(Disposition::Accepted);
        if seq_leq(seg.ack, self.snd.una) {
            if payload.is_empty() && !fin && seg.wnd as u32 == self.snd.wnd {
                if self.timers.rexmt == 0 || seg.ack != self.snd.una {
                    self.dupacks = 0;
                } else {
                    self.dupacks += 1;
                    if self.dupacks == TCP_REXMT_THRESH {
                        arrival.retransmitted = self.fast_retransmit(seg.ack, bufs);
                        arrival.disposition = Disposition::Discarded;
                        return arrival;
                    } else if self.dupacks > TCP_REXMT_THRESH {
                        self.cwnd = self.cwnd.saturating_add(self.maxseg());
                        arrival.disposition = Disposition::Discarded;
                        return arrival;
                    }
                }
            } else {
                self.dupacks = 0;
            }
        } else {
            if seq_gt(seg.ack, self.snd.max) {
                // Acknowledges something not yet sent
                self.flags.ack_now = true;
                return Arrival::new(Disposition::Discarded);
            }
            if let Some(done) = self.new_ack(seg.ack, syn_acked, bufs) {
                return done;
            }
        }

        // Sixth: window update
        if seq_lt(self.snd.wl1, seq) || (self.snd.wl1 == seq && seq_leq(self.snd.wl2, seg.ack)) {
            self.snd.wnd = seg.wnd as u32;
            self.snd.wl1 = seq;
            self.snd.wl2 = seg.ack;
            self.max_sndwnd = self.max_sndwnd.max(self.snd.wnd);
        }

        // Seventh and eighth
        self.receive_text(seq, payload, fin, &mut arrival);
        arrival
    }

    fn reset_received(&mut self) -> Arrival {
        tracing::debug!(state = %self.state, "connection reset by guest");
        let disposition = match self.state {
            State::SynReceived
            | State::Established
            | State::FinWait1
            | State::FinWait2
            | State::CloseWait => Disposition::Reset,
            _ => Disposition::Closed,
        };
        self.state = State::Closed;
        self.timers.cancel_all();
        Arrival::new(disposition)
    }

    /// Three duplicate acknowledgments: resend the missing segment now
    /// without waiting for the timer, then inflate the window by the
    /// segments that have left the network.
    fn fast_retransmit(&mut self, ack: u32, bufs: &SocketBuffers) -> Vec<OutSegment> {
        let onxt = self.snd.nxt;
        let win = (self.snd.wnd.min(self.cwnd) / 2 / self.maxseg()).max(2);
        self.ssthresh = win * self.maxseg();
        self.timers.rexmt = 0;
        self.rtt_ticks = 0;
        self.snd.nxt = ack;
        self.cwnd = self.maxseg();
        let segments = self.output(bufs);
        self.cwnd = self.ssthresh + self.maxseg() * self.dupacks;
        if seq_gt(onxt, self.snd.nxt) {
            self.snd.nxt = onxt;
        }
        tracing::trace!(ack, "fast retransmit");
        segments
    }

    /// Processes an acknowledgment of new data. When `syn_acked` the first
    /// sequence number acknowledged is our SYN rather than data. Returns an
    /// arrival when the segment has been fully dealt with.
    fn new_ack(&mut self, ack: u32, syn_acked: bool, bufs: &mut SocketBuffers) -> Option<Arrival> {
        if self.dupacks >= TCP_REXMT_THRESH && self.cwnd > self.ssthresh {
            self.cwnd = self.ssthresh;
        }
        self.dupacks = 0;
        let acked = ack.wrapping_sub(self.snd.una) - syn_acked as u32;

        if self.rtt_ticks > 0 && seq_gt(ack, self.rtt_seq) {
            self.rtt.sample(self.rtt_ticks);
            self.rtt_ticks = 0;
            self.rxtshift = 0;
            self.rxtcur = self.backed_off_rto(0);
        }

        if ack == self.snd.max {
            self.timers.rexmt = 0;
        } else if self.timers.persist == 0 {
            self.timers.rexmt = self.rxtcur;
        }

        // Open the congestion window: exponentially below the threshold,
        // linearly above it
        let maxseg = self.maxseg();
        let incr = if self.cwnd > self.ssthresh {
            (maxseg * maxseg / self.cwnd).max(1)
        } else {
            maxseg
        };
        self.cwnd = (self.cwnd + incr).min(TCP_MAXCWND);

        // Anything acknowledged past the buffered data is our FIN
        let buffered = bufs.to_guest.len() as u32;
        let fin_acked = if acked > buffered {
            self.snd.wnd = self.snd.wnd.saturating_sub(buffered);
            bufs.to_guest.clear();
            true
        } else {
            self.snd.wnd = self.snd.wnd.saturating_sub(acked);
            bufs.to_guest.drop_front(acked as usize);
            false
        };
        self.snd.una = ack;
        if seq_lt(self.snd.nxt, self.snd.una) {
            self.snd.nxt = self.snd.una;
        }

        match self.state {
            State::FinWait1 if fin_acked => {
                self.state = State::FinWait2;
                // Bound how long a half-closed connection may sit idle
                self.timers.two_msl = TCP_MAXIDLE;
                tracing::trace!("FIN-WAIT-1 -> FIN-WAIT-2");
            }
            State::Closing if fin_acked => {
                self.enter_time_wait();
                tracing::trace!("CLOSING -> TIME-WAIT");
            }
            State::LastAck if fin_acked => {
                self.state = State::Closed;
                self.timers.cancel_all();
                tracing::trace!("LAST-ACK -> CLOSED");
                return Some(Arrival::new(Disposition::Closed));
            }
            State::TimeWait => {
                self.timers.two_msl = 2 * TCPTV_MSL;
                self.flags.ack_now = true;
                return Some(Arrival::new(Disposition::Discarded));
            }
            _ => {}
        }
        None
    }

    /// Seventh and eighth steps: queue or deliver text, then act on a FIN
    /// that is now in sequence.
    fn receive_text(&mut self, seq: u32, payload: Chain, mut fin: bool, arrival: &mut Arrival) {
        if self.state.have_received_fin() {
            return;
        }
        if !payload.is_empty() || fin {
            if seq == self.rcv.nxt {
                if self.out_of_order.is_empty() && self.state == State::Established && !fin {
                    self.flags.delayed_ack = true;
                } else {
                    self.flags.ack_now = true;
                }
                self.rcv.nxt = self.rcv.nxt.wrapping_add(payload.len() as u32);
                arrival.delivered.append(payload);
                if !fin && !self.out_of_order.is_empty() {
                    let (more, queued_fin, nxt) = self.out_of_order.take_in_order(self.rcv.nxt);
                    arrival.delivered.append(more);
                    self.rcv.nxt = nxt;
                    fin = queued_fin;
                }
            } else if seq_geq(seq, self.rcv.nxt) {
                self.out_of_order.insert(Incoming { seq, data: payload, fin });
                fin = false;
                self.flags.ack_now = true;
            }
        }

        if fin {
            self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
            self.flags.ack_now = true;
            arrival.fin = true;
            match self.state {
                State::SynReceived | State::Established => self.state = State::CloseWait,
                State::FinWait1 => self.state = State::Closing,
                State::FinWait2 => self.enter_time_wait(),
                _ => {}
            }
            tracing::trace!(state = %self.state, "FIN received");
        }
    }

    fn enter_time_wait(&mut self) {
        self.state = State::TimeWait;
        self.timers.cancel_all();
        self.timers.two_msl = 2 * TCPTV_MSL;
    }
}
