use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

/// Latest-value channel that delivers every published value, in order, to
/// every subscriber. A new subscriber first receives the current value.
#[derive(Debug)]
pub struct StatusChannel<T> {
    inner: Mutex<StatusInner<T>>,
}

#[derive(Debug)]
struct StatusInner<T> {
    current: T,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

impl<T: Clone + Send> StatusChannel<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                current: initial,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn current(&self) -> T {
        self.lock().current.clone()
    }

    pub fn publish(&self, value: T) {
        let mut inner = self.lock();
        inner.current = value.clone();
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(value.clone()).is_ok());
    }

    pub fn subscribe(&self) -> StatusReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if tx.send(inner.current.clone()).is_ok() {
            inner.subscribers.push(tx);
        }
        StatusReceiver { rx }
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct StatusReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> StatusReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
