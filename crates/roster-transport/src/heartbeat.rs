use std::time::Duration;

use roster_codec::Frame;
use tokio::time::Instant;
use tracing::warn;

use crate::error::ChannelError;
use crate::handler::{FrameHandler, HandlerContext};

/// Sends a heartbeat every `interval` and fails the channel when the peer's
/// heartbeats stop for `interval * timeout_factor`.
pub struct HeartbeatHandler {
    interval: Duration,
    timeout: Duration,
    last_seen: Instant,
    next_send: Instant,
}

impl HeartbeatHandler {
    pub fn new(interval: Duration, timeout_factor: u32) -> Self {
        let now = Instant::now();
        Self {
            interval,
            timeout: interval * timeout_factor.max(1),
            last_seen: now,
            next_send: now + interval,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<H: Send, D: Send> FrameHandler<H, D> for HeartbeatHandler {
    fn on_start(&mut self, ctx: &mut HandlerContext<H, D>) -> Result<(), ChannelError> {
        self.last_seen = ctx.now();
        self.next_send = ctx.now() + self.interval;
        Ok(())
    }

    fn on_inbound(
        &mut self,
        frame: Frame<H, D>,
        ctx: &mut HandlerContext<H, D>,
    ) -> Result<Option<Frame<H, D>>, ChannelError> {
        match frame {
            Frame::Heartbeat => {
                self.last_seen = ctx.now();
                Ok(None)
            }
            other => Ok(Some(other)),
        }
    }

    fn on_tick(&mut self, ctx: &mut HandlerContext<H, D>) -> Result<(), ChannelError> {
        let now = ctx.now();
        let elapsed = now.saturating_duration_since(self.last_seen);
        if elapsed >= self.timeout {
            warn!(?elapsed, "heartbeat timeout");
            return Err(ChannelError::HeartbeatTimeout { elapsed });
        }
        if now >= self.next_send {
            ctx.send(Frame::Heartbeat);
            while self.next_send <= now {
                self.next_send += self.interval;
            }
        }
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        Some(self.next_send.min(self.last_seen + self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use roster_codec::Frame;
    use tokio::time::Instant;

    use super::HeartbeatHandler;
    use crate::error::ChannelError;
    use crate::handler::{FrameHandler, HandlerContext};

    type F = Frame<(), u32>;

    fn ctx_at(now: Instant) -> HandlerContext<(), u32> {
        HandlerContext::new(now)
    }

    #[tokio::test]
    async fn sends_on_interval_and_consumes_peer_heartbeats() {
        let start = Instant::now();
        let mut handler = HeartbeatHandler::new(Duration::from_secs(30), 3);
        FrameHandler::<(), u32>::on_start(&mut handler, &mut ctx_at(start)).expect("start");
        assert_eq!(
            FrameHandler::<(), u32>::next_deadline(&handler),
            Some(start + Duration::from_secs(30))
        );

        let mut c = ctx_at(start + Duration::from_secs(30));
        handler.on_tick(&mut c).expect("tick");
        assert_eq!(c.to_peer, vec![F::Heartbeat]);

        let mut c = ctx_at(start + Duration::from_secs(31));
        assert_eq!(handler.on_inbound(F::Heartbeat, &mut c).expect("inbound"), None);
        assert_eq!(
            handler.on_inbound(F::data(5), &mut c).expect("inbound"),
            Some(F::data(5))
        );
    }

    #[tokio::test]
    async fn fails_after_three_silent_intervals() {
        let start = Instant::now();
        let mut handler = HeartbeatHandler::new(Duration::from_secs(30), 3);
        FrameHandler::<(), u32>::on_start(&mut handler, &mut ctx_at(start)).expect("start");
        assert_eq!(handler.timeout(), Duration::from_secs(90));

        let mut c = ctx_at(start + Duration::from_secs(89));
        handler.on_tick(&mut c).expect("still alive");

        let mut c = ctx_at(start + Duration::from_secs(90));
        assert_eq!(
            handler.on_tick(&mut c),
            Err(ChannelError::HeartbeatTimeout {
                elapsed: Duration::from_secs(90)
            })
        );
    }

    #[tokio::test]
    async fn peer_heartbeat_resets_the_timeout() {
        let start = Instant::now();
        let mut handler = HeartbeatHandler::new(Duration::from_secs(30), 3);
        FrameHandler::<(), u32>::on_start(&mut handler, &mut ctx_at(start)).expect("start");
        handler
            .on_inbound(F::Heartbeat, &mut ctx_at(start + Duration::from_secs(80)))
            .expect("inbound");
        handler
            .on_tick(&mut ctx_at(start + Duration::from_secs(150)))
            .expect("within timeout of last heartbeat");
    }
}
