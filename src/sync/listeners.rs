use {
    futures::Stream,
    std::{
        collections::HashMap,
        pin::Pin,
        sync::{Arc, Mutex},
        task::{Context, Poll},
    },
    tokio::sync::mpsc,
};

struct Inner<E> {
    next_id: u64,
    sinks: HashMap<u64, mpsc::UnboundedSender<E>>,
}

///
/// A set of event consumers.
///
/// Each consumer owns an unbounded queue, so a slow consumer never blocks the producer nor
/// reorders the events of another consumer. Events reach a consumer in emission order.
///
pub struct Listenable<E> {
    inner: Arc<Mutex<Inner<E>>>,
}

impl<E> Clone for Listenable<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for Listenable<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                sinks: HashMap::new(),
            })),
        }
    }
}

///
/// Handle returned by [`Listenable::add_listener`].
///
/// Dropping the handle keeps the listener registered, call [`ListenerHandle::remove`] to unregister it.
///
pub struct ListenerHandle {
    id: u64,
    remove: Box<dyn Fn(u64) + Send + Sync>,
}

impl ListenerHandle {
    pub fn remove(self) {
        (self.remove)(self.id)
    }
}

///
/// Queue of events for one consumer, created by [`Listenable::subscribe`].
///
/// The consumer is unregistered when the subscription is dropped.
///
pub struct Subscription<E> {
    id: u64,
    rx: mpsc::UnboundedReceiver<E>,
    inner: std::sync::Weak<Mutex<Inner<E>>>,
}

impl<E> Subscription<E> {
    ///
    /// Next event, or `None` once the producer side is gone.
    ///
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

impl<E> Stream for Subscription<E> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            if let Ok(mut guard) = inner.lock() {
                guard.sinks.remove(&self.id);
            }
        }
    }
}

impl<E> Listenable<E>
where
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut guard = self.inner.lock().expect("listenable lock poisoned");
            let id = guard.next_id;
            guard.next_id += 1;
            guard.sinks.insert(id, tx);
            id
        };
        Subscription {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    ///
    /// Registers a callback invoked once per event, in emission order, from a dedicated task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    pub fn add_listener<F>(&self, handler: F) -> ListenerHandle
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        let mut subscription = self.subscribe();
        let id = subscription.id;
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                handler(event);
            }
        });
        let weak = Arc::downgrade(&self.inner);
        ListenerHandle {
            id,
            remove: Box::new(move |id| {
                if let Some(inner) = weak.upgrade() {
                    if let Ok(mut guard) = inner.lock() {
                        guard.sinks.remove(&id);
                    }
                }
            }),
        }
    }

    pub fn emit(&self, event: E) {
        let mut guard = self.inner.lock().expect("listenable lock poisoned");
        guard.sinks.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|guard| guard.sinks.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
