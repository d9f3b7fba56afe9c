use std::collections::VecDeque;

use roster_codec::Frame;
use tracing::debug;

use crate::channel::ChannelState;
use crate::error::ChannelError;
use crate::handler::{FrameHandler, HandlerContext};

/// Which end of the handshake this channel plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Sends the hello and waits for the reply.
    Initiator,
    /// Waits for the hello; the application answers it.
    Acceptor,
}

/// Hello exchange.
///
/// The initiator sends its hello on start and holds outgoing data until the
/// reply arrives. Data ahead of the hello, or a second hello, fails the
/// channel.
pub struct HandshakeHandler<H, D> {
    role: HandshakeRole,
    hello: Option<H>,
    completed: bool,
    held: VecDeque<Frame<H, D>>,
}

impl<H, D> HandshakeHandler<H, D> {
    pub fn initiator(hello: H) -> Self {
        Self {
            role: HandshakeRole::Initiator,
            hello: Some(hello),
            completed: false,
            held: VecDeque::new(),
        }
    }

    pub fn acceptor() -> Self {
        Self {
            role: HandshakeRole::Acceptor,
            hello: None,
            completed: false,
            held: VecDeque::new(),
        }
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }
}

impl<H: Send, D: Send> FrameHandler<H, D> for HandshakeHandler<H, D> {
    fn on_start(&mut self, ctx: &mut HandlerContext<H, D>) -> Result<(), ChannelError> {
        if let Some(hello) = self.hello.take() {
            ctx.send(Frame::Hello(hello));
        }
        ctx.set_state(ChannelState::HandshakeInProgress);
        Ok(())
    }

    fn on_inbound(
        &mut self,
        frame: Frame<H, D>,
        ctx: &mut HandlerContext<H, D>,
    ) -> Result<Option<Frame<H, D>>, ChannelError> {
        let is_hello = matches!(frame, Frame::Hello(_));
        let is_data = matches!(frame, Frame::Data { .. });
        match (self.role, self.completed) {
            (HandshakeRole::Initiator, true) if is_hello => Err(ChannelError::UnexpectedHandshakeReply),
            (HandshakeRole::Acceptor, true) if is_hello => Err(ChannelError::DuplicateHello),
            (role, false) if is_hello => {
                self.completed = true;
                while let Some(held) = self.held.pop_front() {
                    ctx.send(held);
                }
                ctx.set_state(ChannelState::Open);
                debug!(?role, "handshake complete");
                Ok(Some(frame))
            }
            (HandshakeRole::Initiator, false) if is_data => Err(ChannelError::DataBeforeHandshakeReply),
            (HandshakeRole::Acceptor, false) if is_data => Err(ChannelError::DataBeforeHello),
            _ => Ok(Some(frame)),
        }
    }

    fn on_outbound(
        &mut self,
        frame: Frame<H, D>,
        _ctx: &mut HandlerContext<H, D>,
    ) -> Result<Option<Frame<H, D>>, ChannelError> {
        if self.completed || self.role == HandshakeRole::Acceptor {
            return Ok(Some(frame));
        }
        match frame {
            Frame::Data { .. } => {
                self.held.push_back(frame);
                Ok(None)
            }
            other => Ok(Some(other)),
        }
    }
}
