use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::backoff::{Condition, Operation};

/// An attempt is either in flight or we are waiting out the delay before the next one.
#[pin_project(project = AttemptProj)]
enum Attempt<O>
where
    O: Operation,
{
    InFlight(#[pin] O::Future),
    Waiting(#[pin] Sleep),
}

/// Future that re-runs an [`Operation`] on retryable failures, sleeping for the next delay of the
/// backoff strategy in between. Resolves to the first success, or to the last error once the
/// condition refuses or the strategy is exhausted.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    attempt: Attempt<O>,
    delays: I,
    operation: O,
    condition: C,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II>(delays: II, mut operation: O, condition: C) -> Self
    where
        II: IntoIterator<IntoIter = I, Item = Duration>,
    {
        Self {
            attempt: Attempt::InFlight(operation.run()),
            delays: delays.into_iter(),
            operation,
            condition,
        }
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            let next = match this.attempt.as_mut().project() {
                AttemptProj::InFlight(fut) => match fut.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                    Poll::Ready(Err(e)) => {
                        if !this.condition.can_retry(&e) {
                            return Poll::Ready(Err(e));
                        }
                        match this.delays.next() {
                            None => return Poll::Ready(Err(e)),
                            Some(delay) => Attempt::Waiting(sleep_until(Instant::now() + delay)),
                        }
                    }
                },
                AttemptProj::Waiting(sleep) => match sleep.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => Attempt::InFlight(this.operation.run()),
                },
            };
            this.attempt.set(next);
        }
    }
}
