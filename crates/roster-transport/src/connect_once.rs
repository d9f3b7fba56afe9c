use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::error::TransportError;

/// Connect-once gate.
///
/// The first caller of [`ConnectOnce::get_or_connect`] starts the connect
/// future on the runtime; every caller, early or late, receives a clone of
/// its single result.
pub struct ConnectOnce<T> {
    started: AtomicBool,
    result: Arc<watch::Sender<Option<Result<T, TransportError>>>>,
    runtime: Handle,
}

impl<T> ConnectOnce<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(runtime: Handle) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            started: AtomicBool::new(false),
            result: Arc::new(tx),
            runtime,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Result of the connect attempt, if it has finished.
    pub fn peek(&self) -> Option<Result<T, TransportError>> {
        self.result.borrow().clone()
    }

    pub async fn get_or_connect<F, Fut>(&self, connect: F) -> Result<T, TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let mut rx = self.result.subscribe();
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let tx = self.result.clone();
            let attempt = connect();
            self.runtime.spawn(async move {
                let result = attempt.await;
                tx.send_replace(Some(result));
            });
        }
        settle(&mut rx).await
    }

    /// Attaches to the attempt without starting one.
    pub async fn wait(&self) -> Result<T, TransportError> {
        let mut rx = self.result.subscribe();
        settle(&mut rx).await
    }
}

async fn settle<T: Clone>(
    rx: &mut watch::Receiver<Option<Result<T, TransportError>>>,
) -> Result<T, TransportError> {
    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return result;
        }
        if rx.changed().await.is_err() {
            return Err(TransportError::Closed);
        }
    }
}
