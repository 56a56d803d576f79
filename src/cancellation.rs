//! A cooperative cancellation signal threaded through every suspension point
//! (spec §5 "Cancellation", §9 "Cooperative cancellation") — a thin wrapper
//! over `tokio::sync::watch` rather than ambient/global state.

use tokio::sync::watch;

#[derive(Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Creates a linked (sender, token) pair; the sender lives with the scheduler
/// or the process's shutdown handler, the token is cloned into every pipeline
/// invocation.
pub fn pair() -> (watch::Sender<bool>, CancellationToken) {
    let (tx, rx) = watch::channel(false);
    (tx, CancellationToken::new(rx))
}
