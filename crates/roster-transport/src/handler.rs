use roster_codec::Frame;
use tokio::time::Instant;

use crate::channel::ChannelState;
use crate::error::ChannelError;

/// Side effects a handler asks the channel driver to perform.
pub struct HandlerContext<H, D> {
    pub(crate) now: Instant,
    pub(crate) to_peer: Vec<Frame<H, D>>,
    pub(crate) state: Option<ChannelState>,
}

impl<H, D> HandlerContext<H, D> {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            now,
            to_peer: Vec::new(),
            state: None,
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Writes `frame` straight to the transport, skipping outbound handlers.
    pub fn send(&mut self, frame: Frame<H, D>) {
        self.to_peer.push(frame);
    }

    pub fn set_state(&mut self, state: ChannelState) {
        self.state = Some(state);
    }
}

/// One stage of a channel's pipeline.
///
/// Inbound frames run through the handlers in order before reaching the
/// application; outbound frames run through them in reverse before reaching
/// the transport. Returning `Ok(None)` consumes the frame. Any `Err` closes
/// the channel.
pub trait FrameHandler<H, D>: Send {
    fn on_start(&mut self, _ctx: &mut HandlerContext<H, D>) -> Result<(), ChannelError> {
        Ok(())
    }

    fn on_inbound(
        &mut self,
        frame: Frame<H, D>,
        ctx: &mut HandlerContext<H, D>,
    ) -> Result<Option<Frame<H, D>>, ChannelError>;

    fn on_outbound(
        &mut self,
        frame: Frame<H, D>,
        _ctx: &mut HandlerContext<H, D>,
    ) -> Result<Option<Frame<H, D>>, ChannelError> {
        Ok(Some(frame))
    }

    /// Called when `next_deadline` passes.
    fn on_tick(&mut self, _ctx: &mut HandlerContext<H, D>) -> Result<(), ChannelError> {
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        None
    }
}
