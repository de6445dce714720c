use std::future::Future;
use std::pin::Pin;

type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Value produced by user code at a plug-in seam, either immediately or by a future
///
/// Connection factories and poll listeners return this type. In-memory transports and
/// channel based listeners answer with [`MaybeAsync::ready`] and never allocate a future;
/// a TCP connect answers with [`MaybeAsync::asynchronous`].
#[must_use]
pub struct MaybeAsync<T> {
    state: State<T>,
}

enum State<T> {
    Ready(T),
    Deferred(BoxedFuture<T>),
}

impl<T> MaybeAsync<T> {
    /// Wrap a value that is already available
    pub fn ready(value: T) -> Self {
        Self {
            state: State::Ready(value),
        }
    }

    /// Wrap a future that produces the value later
    pub fn asynchronous<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            state: State::Deferred(Box::pin(future)),
        }
    }

    /// True if the value is available without awaiting
    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    /// Obtain the value, awaiting the future if there is one
    pub async fn get(self) -> T {
        match self.state {
            State::Ready(value) => value,
            State::Deferred(future) => future.await,
        }
    }
}

impl<T> From<T> for MaybeAsync<T> {
    fn from(value: T) -> Self {
        Self::ready(value)
    }
}

impl<T> std::fmt::Debug for MaybeAsync<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state {
            State::Ready(_) => f.write_str("MaybeAsync(ready)"),
            State::Deferred(_) => f.write_str("MaybeAsync(deferred)"),
        }
    }
}
