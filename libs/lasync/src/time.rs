// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::executor;
use crate::sync::WaitCell;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use pin_project::pin_project;
use std::sync::Arc;
use std::time::Instant;

/// Suspend the current fiber for at least `duration`.
///
/// The sleep is serviced by the worker pool's timer heap; it is not
/// interruptible.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        deadline: Instant::now() + duration,
        cell: None,
    }
}

/// Suspend the current fiber until `deadline` has passed.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        cell: None,
    }
}

/// Future returned by [`sleep`] and [`sleep_until`].
#[pin_project]
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep {
    deadline: Instant,
    /// `None` until the sleep is registered with the executor's timer heap.
    cell: Option<Arc<WaitCell>>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        match &*this.cell {
            None => {
                if Instant::now() >= *this.deadline {
                    return Poll::Ready(());
                }
                let cell = Arc::new(WaitCell::new());
                // Register the waker before handing the cell to the timer so
                // an immediate expiry still finds it.
                let registered = cell.poll_wait(cx);
                debug_assert!(registered.is_pending());
                executor::current().register_timer(*this.deadline, Arc::clone(&cell));
                *this.cell = Some(cell);
                Poll::Pending
            }
            Some(cell) => match cell.poll_wait(cx) {
                Poll::Ready(_) => Poll::Ready(()),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Executor;

    #[test]
    fn sleep_elapses() {
        let exec = Executor::builder().num_workers(1).build();
        let start = Instant::now();
        let fiber = exec.spawn(async {
            sleep(Duration::from_millis(20)).await;
        });
        exec.block_on(fiber).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        exec.shutdown();
    }

    #[test]
    fn zero_sleep_is_immediate() {
        let exec = Executor::builder().num_workers(1).build();
        exec.block_on(async {
            sleep(Duration::ZERO).await;
        });
        exec.shutdown();
    }
}
