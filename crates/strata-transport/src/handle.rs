use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use strata_core::{BoxError, CloseError};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("{0} is already closed")]
    AlreadyClosed(&'static str),
}

/// Anything owning a backend resource that must be released once.
pub trait Close {
    fn close(&self) -> Result<(), BoxError>;
}

type Closer<T> = Box<dyn Fn(T) -> Result<(), BoxError> + Send + Sync>;

/// Backend handle owned by one source or sink.
///
/// The value is handed to its closer exactly once; afterwards every access
/// and every further close reports [`HandleError::AlreadyClosed`].
pub struct OwnedHandle<T> {
    name: &'static str,
    value: Mutex<Option<T>>,
    closer: Closer<T>,
}

impl<T> OwnedHandle<T> {
    /// Wraps `value`; dropping it is the whole close.
    pub fn new(name: &'static str, value: T) -> Self {
        Self::with_closer(name, value, |value| {
            drop(value);
            Ok(())
        })
    }

    pub fn with_closer<F>(name: &'static str, value: T, closer: F) -> Self
    where
        F: Fn(T) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            name,
            value: Mutex::new(Some(value)),
            closer: Box::new(closer),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Runs `f` against the live value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, HandleError> {
        match self.lock().as_ref() {
            Some(value) => Ok(f(value)),
            None => Err(HandleError::AlreadyClosed(self.name)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> OwnedHandle<T> {
    /// Clones the live value out, typically a reference-counted client.
    pub fn get(&self) -> Result<T, HandleError> {
        self.with(T::clone)
    }
}

impl<T> Close for OwnedHandle<T> {
    fn close(&self) -> Result<(), BoxError> {
        let value = self
            .lock()
            .take()
            .ok_or(HandleError::AlreadyClosed(self.name))?;
        (self.closer)(value)
    }
}

impl<T> fmt::Debug for OwnedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedHandle")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Closes every handle in order, attempting all of them regardless of
/// earlier failures, and aggregates what went wrong.
pub fn close_all<'a, I>(handles: I) -> Result<(), CloseError>
where
    I: IntoIterator<Item = &'a dyn Close>,
{
    let mut errors = CloseError::new();
    for handle in handles {
        if let Err(err) = handle.close() {
            errors.push(err);
        }
    }
    errors.into_result()
}

#[cfg(test)]
mod tests {
    use super::{close_all, Close, HandleError, OwnedHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn handle_closes_exactly_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        let handle = OwnedHandle::with_closer("client", 7_u32, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(handle.get(), Ok(7));
        handle.close().expect("first close should succeed");
        let err = handle.close().expect_err("second close should fail");
        assert_eq!(err.to_string(), "client is already closed");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(handle.get(), Err(HandleError::AlreadyClosed("client")));
        assert!(handle.is_closed());
    }

    #[test]
    fn close_all_attempts_every_handle_and_aggregates() {
        let group = OwnedHandle::with_closer("consumer group", (), |_| Err("leave failed".into()));
        let client = OwnedHandle::new("client", ());

        let err = close_all([&group as &dyn Close, &client as &dyn Close])
            .expect_err("group close failure should surface");
        assert_eq!(err.len(), 1);
        assert!(err.to_string().contains("leave failed"));
        assert!(client.is_closed(), "client close must still run");

        let err = close_all([&group as &dyn Close, &client as &dyn Close])
            .expect_err("double close is reported");
        assert_eq!(err.len(), 2);
        assert!(err.to_string().contains("consumer group is already closed"));
        assert!(err.to_string().contains("client is already closed"));
    }
}
