//! Retry an async operation with a backoff [`strategy`] until it succeeds, the [`Condition`]
//! refuses another attempt, or the strategy runs dry.
//!
//! ```rust
//! use aggflow_core::backoff::retry::Retry;
//! use aggflow_core::backoff::strategy::Interval;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let persisted = Retry::new(Interval::from_millis(1).take(3), || async { Ok::<_, ()>(7) }, |_: &()| true);
//! assert_eq!(persisted.await, Ok(7));
//! # }
//! ```

use std::future::Future;

/// Iterators of delays between attempts.
pub mod strategy;

/// The [`retry::Retry`] future.
pub mod retry;

/// Decides whether an error is worth another attempt.
pub trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}

/// Something that can be run more than once, producing a fresh future every time.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    #[must_use = "futures do nothing unless you `.await` or poll them"]
    fn run(&mut self) -> Self::Future;
}

impl<T, E, R, F> Operation for F
where
    R: Future<Output = Result<T, E>>,
    F: FnMut() -> R,
{
    type Item = T;
    type Error = E;
    type Future = R;

    fn run(&mut self) -> Self::Future {
        self()
    }
}
