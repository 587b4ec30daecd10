//! Create-on-first-use cell for broker clients.
//!
//! The listener owns at most one receiver and one session client per entity.
//! Each lives in a [`ClientCell`]: created the first time it is needed,
//! reused afterwards, and taken out (to be closed) when the listener stops so
//! that a restart builds fresh clients. Once the listener is disposed the
//! cell is closed for good and refuses to create anything.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{
    // ---
    BrokerError,
    BrokerResult,
};

struct Slot<T: ?Sized> {
    client: Option<Arc<T>>,
    closed: bool,
}

pub(crate) struct ClientCell<T: ?Sized> {
    slot: Mutex<Slot<T>>,
}

impl<T: ?Sized> ClientCell<T> {
    // ---
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                client: None,
                closed: false,
            }),
        }
    }

    /// Return the cached client, creating it with `create` if the cell is
    /// empty. Concurrent callers wait for a single creation. A failed
    /// creation leaves the cell empty. A closed cell fails with `Disposed`.
    pub(crate) async fn get_or_try_create<F, Fut>(&self, create: F) -> BrokerResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BrokerResult<Arc<T>>>,
    {
        // ---
        let mut slot = self.slot.lock().await;
        if slot.closed {
            return Err(BrokerError::disposed("the listener has been disposed"));
        }
        if let Some(client) = slot.client.as_ref() {
            return Ok(client.clone());
        }

        let client = create().await?;
        slot.client = Some(client.clone());
        Ok(client)
    }

    /// Empty the cell, handing back whatever it held.
    pub(crate) async fn take(&self) -> Option<Arc<T>> {
        self.slot.lock().await.client.take()
    }

    /// Empty the cell and refuse any later creation.
    pub(crate) async fn close(&self) -> Option<Arc<T>> {
        // ---
        let mut slot = self.slot.lock().await;
        slot.closed = true;
        slot.client.take()
    }

    #[cfg(test)]
    pub(crate) async fn is_created(&self) -> bool {
        self.slot.lock().await.client.is_some()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_created_once_and_reset_on_take() {
        // ---
        let cell: ClientCell<str> = ClientCell::new();
        let created = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cell
                .get_or_try_create(|| async {
                    created.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::<str>::from("client"))
                })
                .await
                .unwrap();
            assert_eq!(&*value, "client");
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);

        assert!(cell.take().await.is_some());
        assert!(!cell.is_created().await);

        cell.get_or_try_create(|| async {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::<str>::from("client"))
        })
        .await
        .unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_creation_leaves_cell_empty() {
        // ---
        let cell: ClientCell<str> = ClientCell::new();
        let result = cell
            .get_or_try_create(|| async { Err(BrokerError::transient("unreachable broker")) })
            .await;
        assert_eq!(result.unwrap_err().message(), "unreachable broker");
        assert!(!cell.is_created().await);
    }

    #[tokio::test]
    async fn test_closed_cell_refuses_creation() {
        // ---
        let cell: ClientCell<str> = ClientCell::new();
        cell.get_or_try_create(|| async { Ok(Arc::<str>::from("client")) })
            .await
            .unwrap();

        assert!(cell.close().await.is_some());
        assert!(cell.close().await.is_none());

        let err = cell
            .get_or_try_create(|| async { Ok(Arc::<str>::from("client")) })
            .await
            .unwrap_err();
        assert!(err.is_disposed());
        assert!(!cell.is_created().await);
    }
}
