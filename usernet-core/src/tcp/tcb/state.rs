use std::fmt::{self, Display};

/// The state of a connection, following the state diagram of RFC 9293
/// section 3.3.2.
///
/// ```text
///                             +---------+ ---------\      active OPEN
///                             |  CLOSED |            \    -----------
///                             +---------+<---------\   \   create TCB
///                               |     ^              \   \  snd SYN
///                  passive OPEN |     |   CLOSE        \   \
///                  ------------ |     | ----------       \   \
///                   create TCB  |     | delete TCB         \   \
///                               V     |                      \   \
///           rcv RST (note 1)  +---------+            CLOSE    |    \
///        -------------------->|  LISTEN |          ---------- |     |
///       /                     +---------+          delete TCB |     |
///      /           rcv SYN      |     |     SEND              |     |
///     /           -----------   |     |    -------            |     V
/// +--------+      snd SYN,ACK  /       \   snd SYN          +--------+
/// |        |<-----------------           ------------------>|        |
/// |  SYN   |                    rcv SYN                     |  SYN   |
/// |  RCVD  |<-----------------------------------------------|  SENT  |
/// |        |                  snd SYN,ACK                   |        |
/// |        |------------------           -------------------|        |
/// +--------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +--------+
///    |         --------------   |     |   -----------
///    |                x         |     |     snd ACK
///    |                          V     V
///    |  CLOSE                 +---------+
///    | -------                |  ESTAB  |
///    | snd FIN                +---------+
///    |                 CLOSE    |     |    rcv FIN
///    V                -------   |     |    -------
/// +---------+         snd FIN  /       \   snd ACK         +---------+
/// |  FIN    |<----------------          ------------------>|  CLOSE  |
/// | WAIT-1  |------------------                            |   WAIT  |
/// +---------+          rcv FIN  \                          +---------+
///   | rcv ACK of FIN   -------   |                          CLOSE  |
///   | --------------   snd ACK   |                         ------- |
///   V        x                   V                         snd FIN V
/// +---------+               +---------+                    +---------+
/// |FINWAIT-2|               | CLOSING |                    | LAST-ACK|
/// +---------+               +---------+                    +---------+
///   |              rcv ACK of FIN |                 rcv ACK of FIN |
///   |  rcv FIN     -------------- |    Timeout=2MSL -------------- |
///   |  -------            x       V    ------------        x       V
///    \ snd ACK              +---------+delete TCB          +---------+
///      -------------------->|TIME-WAIT|------------------->| CLOSED  |
///                           +---------+                    +---------+
/// ```
///
/// Here the stack is the guest's peer. A guest-initiated connection is a
/// passive open answered once the host connection completes; a host-forwarded
/// connection is an active open toward the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State {
    /// No connection. A control block in this state is about to be
    /// destroyed and only ever emits a reset.
    Closed,
    /// Waiting for a connection request.
    Listen,
    /// Waiting for a matching connection request after having sent a
    /// connection request.
    SynSent,
    /// Waiting for a confirming connection request acknowledgment after
    /// having both received and sent a connection request.
    SynReceived,
    /// The normal state for the data transfer phase of the connection.
    Established,
    /// Waiting for a connection termination request from the remote TCP.
    CloseWait,
    /// Waiting for a connection termination request from the remote TCP, or
    /// an acknowledgment of the connection termination request previously
    /// sent.
    FinWait1,
    /// Waiting for an acknowledgment of both termination requests.
    Closing,
    /// Waiting for an acknowledgment of the termination request previously
    /// sent to the remote TCP.
    LastAck,
    /// Waiting for a connection termination request from the remote TCP.
    FinWait2,
    /// Waiting for enough time to pass to be sure the remote TCP received
    /// the acknowledgment of its connection termination request.
    TimeWait,
}

impl State {
    /// A SYN has been received from the peer.
    pub fn have_received_syn(self) -> bool {
        self >= Self::SynReceived
    }

    /// The connection has been synchronized in both directions.
    pub fn is_synchronized(self) -> bool {
        self >= Self::Established
    }

    /// A FIN has been received from the peer, so no more data can arrive.
    pub fn have_received_fin(self) -> bool {
        matches!(
            self,
            Self::CloseWait | Self::Closing | Self::LastAck | Self::TimeWait
        )
    }
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN-SENT",
            Self::SynReceived => "SYN-RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::CloseWait => "CLOSE-WAIT",
            Self::FinWait1 => "FIN-WAIT-1",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST-ACK",
            Self::FinWait2 => "FIN-WAIT-2",
            Self::TimeWait => "TIME-WAIT",
        };
        f.write_str(name)
    }
}
