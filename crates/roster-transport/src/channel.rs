use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use roster_codec::Frame;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::MessageConnection;
use crate::error::{ChannelError, TransportError};
use crate::handler::{FrameHandler, HandlerContext};
use crate::handshake::HandshakeHandler;
use crate::heartbeat::HeartbeatHandler;

/// Channel lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    HandshakeInProgress,
    Open,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Idle => "idle",
            ChannelState::HandshakeInProgress => "handshake",
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Runtime settings shared by every channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Period between heartbeats sent to the peer.
    pub heartbeat_interval: Duration,
    /// Missed intervals tolerated before the channel fails.
    pub heartbeat_timeout_factor: u32,
    /// Close the channel gracefully after this lifetime, if set.
    pub auto_timeout: Option<Duration>,
    /// Bound on queued outbound commands.
    pub outbound_capacity: usize,
    /// Bound on received items the application has not taken yet.
    pub inbound_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout_factor: 3,
            auto_timeout: None,
            outbound_capacity: 256,
            inbound_capacity: 256,
        }
    }
}

/// What the application receives from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound<H, D> {
    Hello(H),
    Data { body: D, ack_requested: bool },
}

enum Command<H, D> {
    Send {
        frame: Frame<H, D>,
        ack: Option<oneshot::Sender<Result<(), ChannelError>>>,
    },
}

/// Composes the handler pipeline and starts the driver task.
pub struct ChannelBuilder<H, D> {
    name: String,
    config: ChannelConfig,
    handlers: Vec<Box<dyn FrameHandler<H, D>>>,
}

impl<H, D> ChannelBuilder<H, D>
where
    H: Send + 'static,
    D: Send + 'static,
{
    /// Channel with no handlers; frames pass straight through.
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            name: name.into(),
            config,
            handlers: Vec::new(),
        }
    }

    /// Handshake (sending `hello`) then heartbeat.
    pub fn initiator(name: impl Into<String>, config: ChannelConfig, hello: H) -> Self {
        let heartbeat = HeartbeatHandler::new(config.heartbeat_interval, config.heartbeat_timeout_factor);
        Self::new(name, config)
            .with_handler(Box::new(HandshakeHandler::<H, D>::initiator(hello)))
            .with_handler(Box::new(heartbeat))
    }

    /// Handshake (awaiting the peer's hello) then heartbeat.
    pub fn acceptor(name: impl Into<String>, config: ChannelConfig) -> Self {
        let heartbeat = HeartbeatHandler::new(config.heartbeat_interval, config.heartbeat_timeout_factor);
        Self::new(name, config)
            .with_handler(Box::new(HandshakeHandler::<H, D>::acceptor()))
            .with_handler(Box::new(heartbeat))
    }

    /// Appends a stage after the existing ones.
    pub fn with_handler(mut self, handler: Box<dyn FrameHandler<H, D>>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn spawn(
        self,
        connection: MessageConnection<Frame<H, D>>,
        runtime: &Handle,
    ) -> (ChannelHandle<H, D>, ChannelEvents<H, D>) {
        let (command_tx, command_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ChannelState::Idle);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let driver = Driver {
            name: self.name.clone(),
            handlers: self.handlers,
            connection,
            commands: command_rx,
            inbound: inbound_tx,
            state: state_tx,
            pending_acks: VecDeque::new(),
            auto_close_at: self.config.auto_timeout.map(|t| Instant::now() + t),
            cancel: cancel.clone(),
        };
        runtime.spawn(async move {
            let result = driver.run().await;
            let _ = outcome_tx.send(Some(result));
        });

        (
            ChannelHandle {
                name: self.name,
                commands: command_tx,
                state: state_rx,
                outcome: outcome_rx,
                cancel,
            },
            ChannelEvents { rx: inbound_rx },
        )
    }
}

/// Cloneable control surface of a running channel.
pub struct ChannelHandle<H, D> {
    name: String,
    commands: mpsc::Sender<Command<H, D>>,
    state: watch::Receiver<ChannelState>,
    outcome: watch::Receiver<Option<Result<(), ChannelError>>>,
    cancel: CancellationToken,
}

impl<H, D> Clone for ChannelHandle<H, D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            commands: self.commands.clone(),
            state: self.state.clone(),
            outcome: self.outcome.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<H, D> fmt::Debug for ChannelHandle<H, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl<H, D> ChannelHandle<H, D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Queues `body` for the peer.
    pub async fn send(&self, body: D) -> Result<(), ChannelError> {
        self.command(Frame::data(body), None).await
    }

    /// Sends `body` and waits for the peer's acknowledgement.
    pub async fn send_with_ack(&self, body: D) -> Result<(), ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.command(Frame::data_with_ack(body), Some(tx)).await?;
        rx.await.map_err(|_| ChannelError::AlreadyClosed)?
    }

    /// Answers the peer's hello.
    pub async fn reply_hello(&self, hello: H) -> Result<(), ChannelError> {
        self.command(Frame::Hello(hello), None).await
    }

    /// Acknowledges a received data item that asked for it.
    pub async fn acknowledge(&self) -> Result<(), ChannelError> {
        self.command(Frame::Acknowledgement, None).await
    }

    /// Closes the channel. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Waits for the channel to close; `Ok` for a local shutdown or auto
    /// timeout, otherwise the failure that closed it.
    pub async fn closed(&self) -> Result<(), ChannelError> {
        let mut outcome = self.outcome.clone();
        loop {
            if let Some(result) = outcome.borrow_and_update().clone() {
                return result;
            }
            if outcome.changed().await.is_err() {
                return Err(ChannelError::AlreadyClosed);
            }
        }
    }

    /// Waits until the channel leaves the handshake, returning the state it
    /// reached (`Open` or `Closed`).
    pub async fn ready(&self) -> ChannelState {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if matches!(current, ChannelState::Open | ChannelState::Closed) {
                return current;
            }
            if state.changed().await.is_err() {
                return ChannelState::Closed;
            }
        }
    }

    async fn command(
        &self,
        frame: Frame<H, D>,
        ack: Option<oneshot::Sender<Result<(), ChannelError>>>,
    ) -> Result<(), ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::AlreadyClosed);
        }
        self.commands
            .send(Command::Send { frame, ack })
            .await
            .map_err(|_| ChannelError::AlreadyClosed)
    }
}

/// Items delivered by the peer, in order. Ends when the channel closes.
pub struct ChannelEvents<H, D> {
    rx: mpsc::Receiver<Inbound<H, D>>,
}

impl<H, D> ChannelEvents<H, D> {
    pub async fn recv(&mut self) -> Option<Inbound<H, D>> {
        self.rx.recv().await
    }
}

struct Driver<H, D> {
    name: String,
    handlers: Vec<Box<dyn FrameHandler<H, D>>>,
    connection: MessageConnection<Frame<H, D>>,
    commands: mpsc::Receiver<Command<H, D>>,
    inbound: mpsc::Sender<Inbound<H, D>>,
    state: watch::Sender<ChannelState>,
    pending_acks: VecDeque<oneshot::Sender<Result<(), ChannelError>>>,
    auto_close_at: Option<Instant>,
    cancel: CancellationToken,
}

impl<H: Send + 'static, D: Send + 'static> Driver<H, D> {
    async fn run(mut self) -> Result<(), ChannelError> {
        let result = self.drive().await;
        self.set_state(ChannelState::Closed);
        self.cancel.cancel();
        let reason = result.clone().err().unwrap_or(ChannelError::AlreadyClosed);
        for ack in self.pending_acks.drain(..) {
            let _ = ack.send(Err(reason.clone()));
        }
        match &result {
            Ok(()) => debug!(channel = %self.name, "channel closed"),
            Err(err) => info!(channel = %self.name, error = %err, "channel failed"),
        }
        result
    }

    async fn drive(&mut self) -> Result<(), ChannelError> {
        let mut ctx = HandlerContext::new(Instant::now());
        for handler in self.handlers.iter_mut() {
            handler.on_start(&mut ctx)?;
        }
        if ctx.state.is_none() {
            ctx.set_state(ChannelState::Open);
        }
        self.apply(ctx).await?;

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                command = self.commands.recv() => match command {
                    Some(command) => self.command(command).await?,
                    None => return Ok(()),
                },
                item = self.connection.receiver.recv() => match item {
                    Some(Ok(frame)) => self.inbound(frame).await?,
                    Some(Err(err)) => return Err(err.into()),
                    None => return Err(TransportError::Closed.into()),
                },
                _ = sleep_until(deadline) => self.tick().await?,
            }
        }
    }

    async fn command(&mut self, command: Command<H, D>) -> Result<(), ChannelError> {
        let Command::Send { frame, ack } = command;
        if let Some(ack) = ack {
            self.pending_acks.push_back(ack);
        }
        self.outbound(frame).await
    }

    /// Hands `item` to the application. While its queue is full the driver
    /// keeps sending, so a session blocked on its own sends cannot stall us.
    async fn deliver(&mut self, item: Inbound<H, D>) -> Result<(), ChannelError> {
        let inbound = self.inbound.clone();
        let mut commands_open = true;
        loop {
            tokio::select! {
                permit = inbound.reserve() => {
                    if let Ok(permit) = permit {
                        permit.send(item);
                    }
                    return Ok(());
                }
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.command(command).await?,
                    None => commands_open = false,
                },
                _ = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.handlers
            .iter()
            .filter_map(|h| h.next_deadline())
            .chain(self.auto_close_at)
            .min()
    }

    async fn tick(&mut self) -> Result<(), ChannelError> {
        let now = Instant::now();
        if self.auto_close_at.is_some_and(|at| at <= now) {
            info!(channel = %self.name, "closing channel after its maximum lifetime");
            self.auto_close_at = None;
            self.cancel.cancel();
            return Ok(());
        }
        let mut ctx = HandlerContext::new(now);
        for handler in self.handlers.iter_mut() {
            if handler.next_deadline().is_some_and(|at| at <= now) {
                handler.on_tick(&mut ctx)?;
            }
        }
        self.apply(ctx).await
    }

    async fn outbound(&mut self, frame: Frame<H, D>) -> Result<(), ChannelError> {
        let mut ctx = HandlerContext::new(Instant::now());
        let mut next = Some(frame);
        for handler in self.handlers.iter_mut().rev() {
            next = match next {
                Some(frame) => handler.on_outbound(frame, &mut ctx)?,
                None => break,
            };
        }
        if let Some(frame) = next {
            ctx.send(frame);
        }
        self.apply(ctx).await
    }

    async fn inbound(&mut self, frame: Frame<H, D>) -> Result<(), ChannelError> {
        let mut ctx = HandlerContext::new(Instant::now());
        let mut next = Some(frame);
        for handler in self.handlers.iter_mut() {
            next = match next {
                Some(frame) => handler.on_inbound(frame, &mut ctx)?,
                None => break,
            };
        }
        self.apply(ctx).await?;
        match next {
            Some(Frame::Hello(hello)) => self.deliver(Inbound::Hello(hello)).await?,
            Some(Frame::Data {
                body,
                ack_requested,
            }) => {
                self.deliver(Inbound::Data {
                    body,
                    ack_requested,
                })
                .await?
            }
            Some(Frame::Acknowledgement) => {
                if let Some(ack) = self.pending_acks.pop_front() {
                    let _ = ack.send(Ok(()));
                }
            }
            Some(Frame::Heartbeat) | None => {}
        }
        Ok(())
    }

    async fn apply(&mut self, ctx: HandlerContext<H, D>) -> Result<(), ChannelError> {
        if let Some(state) = ctx.state {
            self.set_state(state);
        }
        for frame in ctx.to_peer {
            self.connection.sender.send(frame).await?;
        }
        Ok(())
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(channel = %self.name, from = %previous, to = %state, "channel state");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
