//! One emulator session: accept the link, then run the stack until the
//! emulator hangs up.

use crate::{cli::Args, host::HostSockets, link::FrameDecoder};
use std::{
    io::{self, Read},
    net::TcpListener,
    thread,
    time::{Duration, Instant},
};
use usernet_core::{InputOutcome, Stack};

/// Longest nap when neither the link nor the timers have anything to do
const IDLE_SLEEP: Duration = Duration::from_millis(5);
const READ_BUFFER: usize = 64 * 1024;

pub fn serve(args: &Args) -> anyhow::Result<()> {
    let mut stack = Stack::new(args.stack_config(), HostSockets::new())?;
    for rule in &args.hostfwds {
        let bound = stack.add_hostfwd(rule.protocol, rule.host, rule.guest)?;
        tracing::info!(protocol = %rule.protocol, %bound, guest = %rule.guest, "host forward");
    }
    for rule in &args.guestfwds {
        stack.add_guestfwd(rule.virtual_endpoint, rule.target)?;
        tracing::info!(virtual_endpoint = %rule.virtual_endpoint, target = %rule.target, "guest forward");
    }

    let listener = TcpListener::bind(args.listen)?;
    tracing::info!(listen = %args.listen, "waiting for the emulator");
    let (mut link, peer) = listener.accept()?;
    link.set_nonblocking(true)?;
    link.set_nodelay(true)?;
    tracing::info!(%peer, "emulator connected");

    let start = Instant::now();
    let mut decoder = FrameDecoder::default();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let received = match link.read(&mut buf) {
            Ok(0) => {
                tracing::info!(
                    stats = ?stack.stats(),
                    host_sockets = stack.callbacks().open_sockets(),
                    partial_frame = decoder.buffered(),
                    "emulator disconnected"
                );
                return Ok(());
            }
            Ok(n) => {
                decoder.extend(&buf[..n]);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => false,
            Err(e) => return Err(e.into()),
        };
        while let Some(frame) = decoder.next_frame()? {
            if let InputOutcome::Dropped(reason) = stack.input(&frame) {
                tracing::trace!(?reason, len = frame.len(), "frame dropped");
            }
        }

        let now = start.elapsed().as_millis() as u64;
        stack.callbacks_mut().clear_deadlines(now);
        stack.poll(now);
        let drained = stack.callbacks_mut().flush_link(&mut link)?;

        if !received && drained {
            let nap = stack
                .callbacks()
                .next_deadline()
                .map_or(IDLE_SLEEP, |deadline| {
                    Duration::from_millis(deadline.saturating_sub(now)).min(IDLE_SLEEP)
                });
            thread::sleep(nap);
        }
    }
}
