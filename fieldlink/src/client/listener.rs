use crate::MaybeAsync;

/// A generic listener type that can be invoked multiple times
///
/// Poll registrations deliver every result (success or terminal error) through this trait.
pub trait Listener<T>: Send {
    /// inform the listener that a new value is available
    fn update(&mut self, _value: T) -> MaybeAsync<()> {
        MaybeAsync::ready(())
    }
}

/// Listener that does nothing
#[derive(Copy, Clone, Debug)]
pub struct NullListener;

impl NullListener {
    /// create a `Box<dyn Listener<T>>` that does nothing
    pub fn create<T>() -> Box<dyn Listener<T>> {
        Box::new(NullListener)
    }
}

impl<T> Listener<T> for NullListener {
    fn update(&mut self, _value: T) -> MaybeAsync<()> {
        MaybeAsync::ready(())
    }
}

/// Any `FnMut(T)` closure can be used as a listener
impl<T, F> Listener<T> for F
where
    F: FnMut(T) + Send,
{
    fn update(&mut self, value: T) -> MaybeAsync<()> {
        self(value);
        MaybeAsync::ready(())
    }
}

/// Forwards values into a Tokio mpsc channel, dropping them if the channel is full
#[derive(Debug)]
pub struct ChannelListener<T> {
    tx: tokio::sync::mpsc::Sender<T>,
}

impl<T> ChannelListener<T> {
    /// Create a listener and the receiving side of its channel
    pub fn create(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<T>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl<T: Send + 'static> Listener<T> for ChannelListener<T> {
    fn update(&mut self, value: T) -> MaybeAsync<()> {
        if self.tx.try_send(value).is_err() {
            tracing::warn!("listener channel is full or closed, dropping value");
        }
        MaybeAsync::ready(())
    }
}
