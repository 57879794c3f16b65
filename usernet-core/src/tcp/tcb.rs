//! The TCP control block. Input and output processing live in the
//! submodules; this file holds the block itself and the connection-wide
//! helpers that both directions use.

use super::{seq::seq_distance, tcp_parsing::Control};
use crate::{mbuf::Chain, socket::sbuf::SocketBuffers};

mod incoming;
pub use incoming::{Incoming, OutOfOrder};

mod input;
pub use input::{Arrival, Disposition};

mod output;
pub use output::OutSegment;

mod rtt;
pub use rtt::RttEstimator;

mod sequence_spaces;
pub use sequence_spaces::{ReceiveSequenceSpace, SendSequenceSpace};

mod state;
pub use state::State;

pub mod timers;
pub use timers::{TimerOutcome, Timers};

#[cfg(test)]
mod tests;

/// Largest window that fits the header without scaling
pub const TCP_MAXWIN: u32 = 65535;
/// Effectively unbounded congestion window before the first segment
const TCP_MAXCWND: u32 = TCP_MAXWIN << 14;
/// Default segment size when the guest offers none
pub const TCP_MSS: u16 = 1460;
/// Floor on any negotiated segment size
const MIN_MSS: u16 = 32;

/// Per-connection settings taken from the stack configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcbConfig {
    /// The largest segment the link allows, MTU and MRU less the IP and TCP
    /// headers
    pub mss: u16,
    /// Probe idle connections
    pub keepalive: bool,
}

impl Default for TcbConfig {
    fn default() -> Self {
        Self {
            mss: TCP_MSS,
            keepalive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Acknowledge immediately
    pub ack_now: bool,
    /// An acknowledgment is owed and goes out on the next fast tick
    pub delayed_ack: bool,
    /// Our FIN has been sent at least once
    pub sent_fin: bool,
    /// Send small segments without waiting for outstanding data
    pub nodelay: bool,
}

#[derive(Debug, Clone)]
pub struct Tcb {
    state: State,
    snd: SendSequenceSpace,
    rcv: ReceiveSequenceSpace,
    config: TcbConfig,
    /// The negotiated segment size
    maxseg: u16,
    cwnd: u32,
    ssthresh: u32,
    /// Largest window the guest has offered
    max_sndwnd: u32,
    flags: Flags,
    timers: Timers,
    rtt: RttEstimator,
    /// Slow ticks since the timed segment was sent, zero when not timing
    rtt_ticks: u32,
    /// The sequence number being timed
    rtt_seq: u32,
    /// Index into the backoff table
    rxtshift: usize,
    /// Current retransmission timeout in slow ticks
    rxtcur: u32,
    dupacks: u32,
    /// Slow ticks since the last segment from the guest
    idle: u32,
    /// Send even into a closed window, for persist probes
    force: bool,
    keepalive: bool,
    out_of_order: OutOfOrder,
}

impl Tcb {
    fn new(iss: u32, config: TcbConfig) -> Self {
        let mut tcb = Self {
            state: State::Closed,
            snd: SendSequenceSpace::new(iss),
            rcv: ReceiveSequenceSpace::default(),
            config,
            maxseg: config.mss,
            cwnd: TCP_MAXCWND,
            ssthresh: TCP_MAXCWND,
            max_sndwnd: 0,
            flags: Flags::default(),
            timers: Timers::default(),
            rtt: RttEstimator::default(),
            rtt_ticks: 0,
            rtt_seq: 0,
            rxtshift: 0,
            rxtcur: 0,
            dupacks: 0,
            idle: 0,
            force: false,
            keepalive: config.keepalive,
            out_of_order: OutOfOrder::default(),
        };
        tcb.rxtcur = tcb.backed_off_rto(0);
        tcb
    }

    /// Answers a connection request from the guest (RFC 9293 section
    /// 3.10.7.2). The SYN,ACK goes out on the next output, which the owner
    /// holds back until the host side of the connection is ready.
    pub fn passive_open(syn_seq: u32, syn_wnd: u16, mss: Option<u16>, iss: u32, config: TcbConfig) -> Self {
        let mut tcb = Self::new(iss, config);
        tcb.state = State::SynReceived;
        tcb.rcv.irs = syn_seq;
        tcb.rcv.nxt = syn_seq.wrapping_add(1);
        tcb.rcv.adv = tcb.rcv.nxt;
        tcb.snd.wnd = syn_wnd as u32;
        tcb.snd.wl1 = syn_seq;
        tcb.max_sndwnd = tcb.snd.wnd;
        tcb.negotiate_mss(mss);
        tcb.flags.ack_now = true;
        tcb.timers.keep = timers::TCPTV_KEEP_INIT;
        tcb
    }

    /// Starts a connection toward the guest. The SYN goes out on the next
    /// output.
    pub fn active_open(iss: u32, config: TcbConfig) -> Self {
        let mut tcb = Self::new(iss, config);
        tcb.state = State::SynSent;
        tcb.timers.keep = timers::TCPTV_KEEP_INIT;
        tcb
    }

    /// Settles the segment size from the guest's offer and restarts the
    /// congestion window at one segment.
    fn negotiate_mss(&mut self, offer: Option<u16>) {
        let mut mss = self.config.mss;
        if let Some(offer) = offer {
            mss = mss.min(offer);
        }
        self.maxseg = mss.max(MIN_MSS);
        self.cwnd = self.maxseg as u32;
    }

    /// Abandons the connection. A connection that has heard from the guest
    /// moves to CLOSED and its next output is a reset; otherwise it can be
    /// destroyed quietly.
    pub fn drop_connection(&mut self) -> TimerOutcome {
        self.timers.cancel_all();
        self.out_of_order.clear();
        let had_syn = self.state.have_received_syn();
        self.state = State::Closed;
        if had_syn {
            TimerOutcome::Dropped
        } else {
            TimerOutcome::Closed
        }
    }

    /// The host side will send no more. Moves toward sending our FIN.
    /// Returns whether the control block is finished and can be destroyed.
    pub fn close_local(&mut self) -> bool {
        match self.state {
            State::Closed | State::Listen | State::SynSent => {
                self.state = State::Closed;
                return true;
            }
            State::SynReceived | State::Established => self.state = State::FinWait1,
            State::CloseWait => self.state = State::LastAck,
            _ => {}
        }
        tracing::trace!(state = %self.state, "local close");
        false
    }

    /// A keepalive probe: an old sequence number the guest must acknowledge.
    pub fn keepalive_probe(&self) -> OutSegment {
        OutSegment::control(
            self.snd.una.wrapping_sub(1),
            self.rcv.nxt,
            Control::ACK,
            0,
        )
    }

    /// Window we are prepared to accept: the buffer space toward the host,
    /// but never less than what was already advertised.
    fn receive_window(&self, bufs: &SocketBuffers) -> u32 {
        let space = (bufs.to_host.space() as u32).min(TCP_MAXWIN);
        space.max(seq_distance(self.rcv.nxt, self.rcv.adv))
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn snd(&self) -> &SendSequenceSpace {
        &self.snd
    }

    pub fn rcv(&self) -> &ReceiveSequenceSpace {
        &self.rcv
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn maxseg(&self) -> u32 {
        self.maxseg as u32
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn rxtshift(&self) -> usize {
        self.rxtshift
    }

    pub fn set_nodelay(&mut self, nodelay: bool) {
        self.flags.nodelay = nodelay;
    }

    /// Data held out of order
    pub fn queued_bytes(&self) -> usize {
        self.out_of_order.bytes()
    }

    /// An acknowledgment is owed on the next fast tick.
    pub fn wants_fast_tick(&self) -> bool {
        self.flags.delayed_ack
    }
}

impl OutSegment {
    pub(crate) fn control(seq: u32, ack: u32, ctl: Control, wnd: u16) -> Self {
        Self {
            seq,
            ack,
            ctl,
            wnd,
            mss: None,
            payload: Chain::default(),
        }
    }
}
