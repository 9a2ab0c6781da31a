//! In-process message bus for cooperatively scheduled tasks.
//!
//! A [`Bus`] owns a set of bounded channels carrying `u32` items between
//! single-threaded async tasks. Channels are multi-producer multi-consumer;
//! blocked producers and consumers park on per-channel FIFO waiter lists and
//! are unblocked strictly in arrival order. The bus never spans a suspension
//! point while its state is borrowed, so a plain single-threaded executor
//! (for example `futures::executor::LocalPool`) is the intended runtime.
//!
//! Every blocking operation re-checks its condition after each wakeup:
//! another task may have raced ahead, or the channel may have been closed
//! under the sleeper, which surfaces as [`BusError::NoChannel`].

mod queue;
mod waiter;

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::slot_table::SlotTable;
use queue::ItemQueue;
use waiter::{WaiterList, yield_now};

/// Failure modes of bus operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    /// The channel is closed or was never opened.
    #[error("no such channel")]
    NoChannel,
    /// A non-blocking operation found the channel full (send) or empty
    /// (recv). Blocking variants convert this into a suspension instead.
    #[error("operation would block")]
    WouldBlock,
}

/// Stable handle to an open channel. Valid until [`Bus::channel_close`];
/// the index may be recycled by a later open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(usize);

#[derive(Debug)]
struct Channel {
    queue: ItemQueue,
    send_waiters: WaiterList,
    recv_waiters: WaiterList,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        Channel {
            queue: ItemQueue::new(capacity),
            send_waiters: WaiterList::default(),
            recv_waiters: WaiterList::default(),
        }
    }
}

/// Handle to a bus instance. Clones share the same channel set, which is how
/// tasks on one executor talk to each other.
#[derive(Debug, Clone, Default)]
pub struct Bus {
    channels: Rc<RefCell<SlotTable<Channel>>>,
}

impl Bus {
    /// Creates a bus with no channels.
    pub fn new() -> Self {
        Bus::default()
    }

    /// Opens a channel holding at most `capacity` items. The lowest vacant
    /// slot is recycled before the slot vector grows.
    pub fn channel_open(&self, capacity: usize) -> ChannelId {
        let id = self.channels.borrow_mut().insert(Channel::new(capacity));
        log::debug!("channel {id} opened, capacity {capacity}");
        ChannelId(id)
    }

    /// Closes the channel. The slot empties immediately; every parked
    /// producer, then every parked consumer, is woken (yielding between
    /// wakeups) so each observes the channel as gone and reports
    /// [`BusError::NoChannel`] from its own call.
    pub async fn channel_close(&self, ch: ChannelId) -> Result<(), BusError> {
        let channel = self
            .channels
            .borrow_mut()
            .remove(ch.0)
            .ok_or(BusError::NoChannel)?;
        log::debug!("channel {} closed", ch.0);
        while !channel.send_waiters.is_empty() {
            channel.send_waiters.wake_first();
            yield_now().await;
        }
        while !channel.recv_waiters.is_empty() {
            channel.recv_waiters.wake_first();
            yield_now().await;
        }
        Ok(())
    }

    /// Enqueues one item without blocking and wakes the head consumer.
    pub fn try_send(&self, ch: ChannelId, value: u32) -> Result<(), BusError> {
        let mut channels = self.channels.borrow_mut();
        let channel = channels.get_mut(ch.0).ok_or(BusError::NoChannel)?;
        if channel.queue.is_full() {
            return Err(BusError::WouldBlock);
        }
        channel.queue.push(value);
        channel.recv_waiters.wake_first();
        Ok(())
    }

    /// Dequeues one item without blocking and wakes the head producer.
    pub fn try_recv(&self, ch: ChannelId) -> Result<u32, BusError> {
        let mut channels = self.channels.borrow_mut();
        let channel = channels.get_mut(ch.0).ok_or(BusError::NoChannel)?;
        let value = channel.queue.pop().ok_or(BusError::WouldBlock)?;
        channel.send_waiters.wake_first();
        Ok(value)
    }

    /// Sends one item, suspending while the channel is full.
    pub async fn send(&self, ch: ChannelId, value: u32) -> Result<(), BusError> {
        loop {
            match self.try_send(ch, value) {
                Err(BusError::WouldBlock) => self.park_sender(ch).await?,
                done => return done,
            }
        }
    }

    /// Receives one item, suspending while the channel is empty.
    pub async fn recv(&self, ch: ChannelId) -> Result<u32, BusError> {
        loop {
            match self.try_recv(ch) {
                Err(BusError::WouldBlock) => self.park_receiver(ch).await?,
                done => return done,
            }
        }
    }

    /// Enqueues as many leading items of `values` as currently fit, in one
    /// critical section. Zero space reports [`BusError::WouldBlock`].
    pub fn try_send_many(&self, ch: ChannelId, values: &[u32]) -> Result<usize, BusError> {
        let mut channels = self.channels.borrow_mut();
        let channel = channels.get_mut(ch.0).ok_or(BusError::NoChannel)?;
        if channel.queue.is_full() {
            return Err(BusError::WouldBlock);
        }
        let sent = channel.queue.push_many(values);
        channel.recv_waiters.wake_first();
        Ok(sent)
    }

    /// Dequeues whatever is available, up to `out.len()`, in one critical
    /// section. An empty queue reports [`BusError::WouldBlock`].
    pub fn try_recv_many(&self, ch: ChannelId, out: &mut [u32]) -> Result<usize, BusError> {
        let mut channels = self.channels.borrow_mut();
        let channel = channels.get_mut(ch.0).ok_or(BusError::NoChannel)?;
        if channel.queue.is_empty() {
            return Err(BusError::WouldBlock);
        }
        let received = channel.queue.pop_many(out);
        channel.send_waiters.wake_first();
        Ok(received)
    }

    /// Sends the whole batch if it can do so without ever having sent part
    /// of it and then stalling: the call suspends only while nothing has
    /// been transferred yet, and otherwise returns the partial count.
    pub async fn send_many(&self, ch: ChannelId, values: &[u32]) -> Result<usize, BusError> {
        let mut sent = 0;
        loop {
            match self.try_send_many(ch, &values[sent..]) {
                Ok(n) => {
                    sent += n;
                    if sent == values.len() {
                        return Ok(sent);
                    }
                }
                Err(BusError::WouldBlock) => {
                    if sent > 0 {
                        return Ok(sent);
                    }
                    self.park_sender(ch).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Receives at least one item, suspending while the channel is empty,
    /// then drains whatever else is available into `out` in the same pass.
    pub async fn recv_many(&self, ch: ChannelId, out: &mut [u32]) -> Result<usize, BusError> {
        loop {
            match self.try_recv_many(ch, out) {
                Err(BusError::WouldBlock) => self.park_receiver(ch).await?,
                done => return done,
            }
        }
    }

    /// Pushes `value` into every open channel, all or nothing. Any full
    /// channel fails the whole call with [`BusError::WouldBlock`]; no open
    /// channel at all is [`BusError::NoChannel`].
    pub fn try_broadcast(&self, value: u32) -> Result<(), BusError> {
        let mut channels = self.channels.borrow_mut();
        if channels.len() == 0 {
            return Err(BusError::NoChannel);
        }
        if channels.iter().any(|(_, channel)| channel.queue.is_full()) {
            return Err(BusError::WouldBlock);
        }
        for (_, channel) in channels.iter_mut() {
            channel.queue.push(value);
            channel.recv_waiters.wake_first();
        }
        Ok(())
    }

    /// Broadcasts `value`, suspending on whichever channel is full until
    /// every open channel has room in the same instant.
    pub async fn broadcast(&self, value: u32) -> Result<(), BusError> {
        loop {
            match self.try_broadcast(value) {
                Err(BusError::WouldBlock) => {
                    let full = self.channels.borrow().iter().find_map(|(_, channel)| {
                        channel
                            .queue
                            .is_full()
                            .then(|| channel.send_waiters.clone())
                    });
                    match full {
                        Some(waiters) => waiters.suspend().await,
                        // Whoever was full drained before we could park;
                        // take another shot.
                        None => yield_now().await,
                    }
                }
                done => return done,
            }
        }
    }

    async fn park_sender(&self, ch: ChannelId) -> Result<(), BusError> {
        let suspend = {
            let channels = self.channels.borrow();
            let channel = channels.get(ch.0).ok_or(BusError::NoChannel)?;
            channel.send_waiters.suspend()
        };
        suspend.await;
        Ok(())
    }

    async fn park_receiver(&self, ch: ChannelId) -> Result<(), BusError> {
        let suspend = {
            let channels = self.channels.borrow();
            let channel = channels.get(ch.0).ok_or(BusError::NoChannel)?;
            channel.recv_waiters.suspend()
        };
        suspend.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_ops_round_trip() {
        let bus = Bus::new();
        let ch = bus.channel_open(2);
        bus.try_send(ch, 1).unwrap();
        bus.try_send(ch, 2).unwrap();
        assert_eq!(bus.try_send(ch, 3), Err(BusError::WouldBlock));
        assert_eq!(bus.try_recv(ch), Ok(1));
        assert_eq!(bus.try_recv(ch), Ok(2));
        assert_eq!(bus.try_recv(ch), Err(BusError::WouldBlock));
    }

    #[test]
    fn closed_slot_is_recycled() {
        let bus = Bus::new();
        let first = bus.channel_open(1);
        futures::executor::block_on(bus.channel_close(first)).unwrap();
        let second = bus.channel_open(1);
        assert_eq!(first, second);
        assert_eq!(bus.try_recv(second), Err(BusError::WouldBlock));
    }

    #[test]
    fn vacant_channel_reports_no_channel() {
        let bus = Bus::new();
        let ch = bus.channel_open(1);
        futures::executor::block_on(bus.channel_close(ch)).unwrap();
        assert_eq!(bus.try_send(ch, 9), Err(BusError::NoChannel));
        assert_eq!(bus.try_recv(ch), Err(BusError::NoChannel));
        assert_eq!(
            futures::executor::block_on(bus.channel_close(ch)),
            Err(BusError::NoChannel)
        );
    }

    #[test]
    fn batch_transfer_reports_partial_counts() {
        let bus = Bus::new();
        let ch = bus.channel_open(3);
        assert_eq!(bus.try_send_many(ch, &[1, 2, 3, 4, 5]), Ok(3));
        assert_eq!(bus.try_send_many(ch, &[6]), Err(BusError::WouldBlock));
        let mut out = [0; 2];
        assert_eq!(bus.try_recv_many(ch, &mut out), Ok(2));
        assert_eq!(out, [1, 2]);
        let mut rest = [0; 4];
        assert_eq!(bus.try_recv_many(ch, &mut rest), Ok(1));
        assert_eq!(rest[0], 3);
    }

    #[test]
    fn broadcast_is_all_or_nothing() {
        let bus = Bus::new();
        assert_eq!(bus.try_broadcast(7), Err(BusError::NoChannel));
        let a = bus.channel_open(1);
        let b = bus.channel_open(1);
        bus.try_broadcast(7).unwrap();
        assert_eq!(bus.try_broadcast(8), Err(BusError::WouldBlock));
        assert_eq!(bus.try_recv(a), Ok(7));
        assert_eq!(bus.try_recv(b), Ok(7));
    }
}
