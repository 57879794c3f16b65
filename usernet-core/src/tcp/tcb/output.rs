//! Segment production. Every segment sent on a connection comes from
//! [`Tcb::output`], which decides from the windows, the buffered data, and
//! the pending flags whether anything is worth sending.

use super::{State, Tcb, TCP_MAXWIN};
use crate::{
    mbuf::Chain,
    socket::sbuf::SocketBuffers,
    tcp::{
        seq::{seq_distance, seq_gt, seq_lt},
        tcp_parsing::Control,
    },
};

/// A segment ready for addressing and checksumming by the owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutSegment {
    pub seq: u32,
    pub ack: u32,
    pub ctl: Control,
    pub wnd: u16,
    /// Maximum segment size option, only on SYNs
    pub mss: Option<u16>,
    pub payload: Chain,
}

impl Tcb {
    /// The control bits each state sends with, before per-segment
    /// adjustments.
    fn out_flags(&self) -> Control {
        let syn_due = self.snd.nxt == self.snd.iss;
        match self.state {
            State::Closed => Control::RST_ACK,
            State::Listen => Control::default(),
            State::SynSent if syn_due => Control::SYN,
            State::SynSent => Control::default(),
            State::SynReceived if syn_due => Control::SYN_ACK,
            State::FinWait1 | State::Closing | State::LastAck => Control::FIN_ACK,
            _ => Control::ACK,
        }
    }

    /// Produces whatever segments are due. May return nothing.
    pub fn output(&mut self, bufs: &SocketBuffers) -> Vec<OutSegment> {
        let mut segments = vec![];
        if self.state == State::Closed {
            segments.push(OutSegment::control(
                self.snd.nxt,
                self.rcv.nxt,
                Control::RST_ACK,
                0,
            ));
            self.flags.ack_now = false;
            return segments;
        }

        let maxseg = self.maxseg() as usize;
        let sb_len = bufs.to_guest.len();
        // Restart slow start after an idle period
        let idle = self.snd.max == self.snd.una;
        if idle && self.idle >= self.rxtcur {
            self.cwnd = self.maxseg();
        }

        loop {
            let off = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
            let mut win = self.snd.wnd.min(self.cwnd) as usize;
            let mut ctl = self.out_flags();

            if self.force {
                if win == 0 {
                    // Probe with one byte, holding back the FIN if data
                    // remains
                    if off < sb_len {
                        ctl.remove(Control::FIN);
                    }
                    win = 1;
                } else {
                    self.timers.persist = 0;
                    self.rxtshift = 0;
                }
            }

            // No data rides along until the SYN is acknowledged
            let syn_outstanding = matches!(self.state, State::SynSent | State::SynReceived);
            let mut len: isize = if syn_outstanding {
                0
            } else {
                sb_len.min(win) as isize - off as isize
            };
            if len < 0 {
                // The FIN is outstanding or the window shrank past what was
                // sent. With a closed window, pull back and let persist
                // probe.
                len = 0;
                if win == 0 {
                    self.timers.rexmt = 0;
                    self.snd.nxt = self.snd.una;
                }
            }
            let mut len = len as usize;
            let mut sendalot = false;
            if len > maxseg {
                len = maxseg;
                sendalot = true;
            }
            let off = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
            if off + len < sb_len {
                ctl.remove(Control::FIN);
            }

            let space = bufs.to_host.space().min(TCP_MAXWIN as usize);
            if !self.should_send(ctl, len, off, sb_len, idle, space, bufs.to_host.capacity()) {
                // Data is waiting but nothing can go: make sure a timer will
                // come back for it
                if sb_len > 0 && self.timers.rexmt == 0 && self.timers.persist == 0 {
                    self.rxtshift = 0;
                    self.set_persist();
                }
                break;
            }

            // Retransmitting the FIN: back up over it
            if ctl.fin() && self.flags.sent_fin && self.snd.nxt == self.snd.max {
                self.snd.nxt = self.snd.nxt.wrapping_sub(1);
            }
            let payload = if len > 0 {
                Chain::new(bufs.to_guest.copy_range(off, len))
            } else {
                Chain::default()
            };
            if len > 0 && off + len == sb_len {
                ctl.insert(Control::PSH);
            }
            let seq = if len > 0 || ctl.syn() || ctl.fin() || self.timers.persist != 0 {
                self.snd.nxt
            } else {
                self.snd.max
            };

            // Avoid silly window syndrome, and never shrink the window
            let mut wnd = space as u32;
            if (wnd as usize) < bufs.to_host.capacity() / 4 && (wnd as usize) < maxseg {
                wnd = 0;
            }
            wnd = wnd
                .min(TCP_MAXWIN)
                .max(seq_distance(self.rcv.nxt, self.rcv.adv));

            let advances = ctl.syn() as u32 + ctl.fin() as u32 + len as u32;
            if !self.force || self.timers.persist == 0 {
                let start = self.snd.nxt;
                if ctl.fin() {
                    self.flags.sent_fin = true;
                }
                self.snd.nxt = self.snd.nxt.wrapping_add(advances);
                if seq_gt(self.snd.nxt, self.snd.max) {
                    self.snd.max = self.snd.nxt;
                    if self.rtt_ticks == 0 {
                        self.rtt_ticks = 1;
                        self.rtt_seq = start;
                    }
                }
                if self.timers.rexmt == 0 && self.snd.nxt != self.snd.una {
                    self.timers.rexmt = self.rxtcur;
                    if self.timers.persist != 0 {
                        self.timers.persist = 0;
                        self.rxtshift = 0;
                    }
                }
            } else if seq_gt(seq.wrapping_add(advances), self.snd.max) {
                self.snd.max = seq.wrapping_add(advances);
            }

            if wnd > 0 && seq_gt(self.rcv.nxt.wrapping_add(wnd), self.rcv.adv) {
                self.rcv.adv = self.rcv.nxt.wrapping_add(wnd);
            }
            self.rcv.wnd = wnd;
            self.flags.ack_now = false;
            self.flags.delayed_ack = false;

            let mss = ctl.syn().then_some(self.config.mss);
            segments.push(OutSegment {
                seq,
                ack: if ctl.ack() { self.rcv.nxt } else { 0 },
                ctl,
                wnd: wnd as u16,
                mss,
                payload,
            });

            if !sendalot {
                break;
            }
        }
        self.force = false;
        segments
    }

    #[allow(clippy::too_many_arguments)]
    fn should_send(
        &self,
        ctl: Control,
        len: usize,
        off: usize,
        sb_len: usize,
        idle: bool,
        space: usize,
        capacity: usize,
    ) -> bool {
        let maxseg = self.maxseg() as usize;
        if len > 0 {
            if len == maxseg {
                return true;
            }
            // Nagle: a short segment goes only when nothing is outstanding
            if (idle || self.flags.nodelay) && len + off >= sb_len {
                return true;
            }
            if self.force {
                return true;
            }
            if self.max_sndwnd > 0 && len >= self.max_sndwnd as usize / 2 {
                return true;
            }
            if seq_lt(self.snd.nxt, self.snd.max) {
                return true;
            }
        }

        // A window update worth announcing
        if self.state.have_received_syn() && space > 0 {
            let advertised = seq_distance(self.rcv.nxt, self.rcv.adv) as usize;
            let opening = space.saturating_sub(advertised);
            if opening >= 2 * maxseg || 2 * opening >= capacity {
                return true;
            }
        }

        if self.flags.ack_now {
            return true;
        }
        if ctl.syn() || ctl.rst() {
            return true;
        }
        ctl.fin() && (!self.flags.sent_fin || self.snd.nxt == self.snd.una)
    }
}
