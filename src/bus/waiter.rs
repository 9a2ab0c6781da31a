//! Waiter lists for suspended cooperative tasks.
//!
//! A task that cannot make progress parks itself at the tail of the relevant
//! list; whoever creates progress wakes exactly the head entry. Wakeups carry
//! no payload: a woken task owns nothing but the right to re-check its
//! condition, so spurious wakeups are harmless by construction.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

#[derive(Debug)]
struct WaitEntry {
    woken: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

/// FIFO of suspended tasks, woken head-first.
#[derive(Debug, Clone, Default)]
pub(crate) struct WaiterList {
    entries: Rc<RefCell<VecDeque<Rc<WaitEntry>>>>,
}

impl WaiterList {
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Unlinks and wakes the head entry, if any.
    pub(crate) fn wake_first(&self) {
        let head = self.entries.borrow_mut().pop_front();
        if let Some(entry) = head {
            entry.woken.set(true);
            if let Some(waker) = entry.waker.borrow_mut().take() {
                waker.wake();
            }
        }
    }

    /// Parks the calling task at the tail. The returned future completes
    /// once `wake_first` reaches this entry.
    pub(crate) fn suspend(&self) -> Suspend {
        let entry = Rc::new(WaitEntry {
            woken: Cell::new(false),
            waker: RefCell::new(None),
        });
        self.entries.borrow_mut().push_back(Rc::clone(&entry));
        Suspend {
            list: self.clone(),
            entry,
        }
    }
}

/// A single suspension. Dropping it before the wakeup unlinks the entry.
#[derive(Debug)]
pub(crate) struct Suspend {
    list: WaiterList,
    entry: Rc<WaitEntry>,
}

impl Future for Suspend {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.entry.woken.get() {
            Poll::Ready(())
        } else {
            *self.entry.waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for Suspend {
    fn drop(&mut self) {
        if !self.entry.woken.get() {
            self.list
                .entries
                .borrow_mut()
                .retain(|other| !Rc::ptr_eq(other, &self.entry));
        }
    }
}

/// Cedes the executor to every other runnable task exactly once.
pub(crate) fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
pub(crate) struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use std::task::Poll;

    fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn head_first_wakeup() {
        let list = WaiterList::default();
        let mut first = list.suspend();
        let mut second = list.suspend();
        assert!(poll_once(&mut first).is_pending());
        assert!(poll_once(&mut second).is_pending());

        list.wake_first();
        assert!(poll_once(&mut first).is_ready());
        assert!(poll_once(&mut second).is_pending());

        list.wake_first();
        assert!(poll_once(&mut second).is_ready());
        assert!(list.is_empty());
    }

    #[test]
    fn dropped_suspension_unlinks_itself() {
        let list = WaiterList::default();
        let abandoned = list.suspend();
        let mut kept = list.suspend();
        drop(abandoned);

        list.wake_first();
        assert!(poll_once(&mut kept).is_ready());
        assert!(list.is_empty());
    }

    #[test]
    fn yield_now_completes_on_second_poll() {
        futures::executor::block_on(async {
            let mut polls = 0;
            let mut inner = yield_now();
            poll_fn(|cx| {
                polls += 1;
                Pin::new(&mut inner).poll(cx)
            })
            .await;
            assert_eq!(polls, 2);
        });
    }
}
