use crate::error::Shutdown;

/// wrap a Tokio receiver and only provide a recv() that returns a Result<T, Shutdown>
/// that makes it harder to misuse.
pub(crate) struct Receiver<T>(tokio::sync::mpsc::Receiver<T>);

impl<T> From<tokio::sync::mpsc::Receiver<T>> for Receiver<T> {
    fn from(value: tokio::sync::mpsc::Receiver<T>) -> Self {
        Self(value)
    }
}

impl<T> Receiver<T> {
    pub(crate) async fn recv(&mut self) -> Result<T, Shutdown> {
        self.0.recv().await.ok_or(Shutdown)
    }

    /// Refuse new values and return everything that is still queued
    pub(crate) fn close_and_drain(&mut self) -> Vec<T> {
        self.0.close();
        let mut remaining = Vec::new();
        while let Ok(value) = self.0.try_recv() {
            remaining.push(value);
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_fails_with_shutdown_once_senders_are_gone() {
        let (tx, rx) = tokio::sync::mpsc::channel::<u8>(4);
        let mut rx: Receiver<u8> = rx.into();
        tx.send(1).await.unwrap();
        drop(tx);
        assert_eq!(rx.recv().await, Ok(1));
        assert_eq!(rx.recv().await, Err(Shutdown));
    }

    #[tokio::test]
    async fn drain_returns_queued_values_and_closes() {
        let (tx, rx) = tokio::sync::mpsc::channel::<u8>(4);
        let mut rx: Receiver<u8> = rx.into();
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        assert_eq!(rx.close_and_drain(), vec![1, 2]);
        assert!(tx.try_send(3).is_err());
    }
}
