//! A free list of reusable channels.
//!
//! Opening a channel costs a round-trip to the broker (two, with publisher confirms enabled):
//! [`ChannelPool`] lets publishers and declaration operations reuse channels across calls.
//!
//! The pool itself does not validate what it stores - it only remembers when each channel was
//! handed back. Whoever pulls a channel checks [`PooledChannel::is_reusable`] and disposes of
//! closed or stale ones (see [`Client`](crate::client::Client)).
//!
//! ```rust
//! use carrot_relay::pool::ChannelPool;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = ChannelPool::new();
//! pool.push("a channel");
//!
//! let pooled = pool.pull().unwrap();
//! assert!(pooled.idle_for() < Duration::from_secs(60));
//! assert!(pool.pull().is_none());
//! # }
//! ```
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::transport::BrokerChannel;

/// Channels idle for longer than this are not reused.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60);

/// A channel sitting in a [`ChannelPool`], stamped with the instant it was returned.
#[derive(Debug)]
pub struct PooledChannel<C> {
    channel: C,
    returned_at: Instant,
}

impl<C> PooledChannel<C> {
    /// How long the channel has been sitting in the pool.
    pub fn idle_for(&self) -> Duration {
        self.returned_at.elapsed()
    }

    pub fn into_inner(self) -> C {
        self.channel
    }
}

impl<C: BrokerChannel> PooledChannel<C> {
    /// A pooled channel can be handed out again if it is still open and it has not been
    /// idle for `max_idle` or longer.
    pub fn is_reusable(&self, max_idle: Duration) -> bool {
        !self.channel.is_closed() && self.idle_for() < max_idle
    }
}

/// `ChannelPool` is a thread-safe FIFO of idle channels.
///
/// Both [`ChannelPool::push`] and [`ChannelPool::pull`] are O(1) and never wait on anything
/// but the (uncontended, short-lived) internal lock.
/// A channel that was pushed once is pulled at most once.
#[derive(Debug)]
pub struct ChannelPool<C> {
    idle: Mutex<VecDeque<PooledChannel<C>>>,
}

impl<C> Default for ChannelPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ChannelPool<C> {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
        }
    }

    /// Hand a channel back to the pool.
    pub fn push(&self, channel: C) {
        let pooled = PooledChannel {
            channel,
            returned_at: Instant::now(),
        };
        self.idle().push_back(pooled);
    }

    /// Take the least-recently-returned channel out of the pool.
    ///
    /// `None` if the pool is empty.
    pub fn pull(&self) -> Option<PooledChannel<C>> {
        self.idle().pop_front()
    }

    pub fn len(&self) -> usize {
        self.idle().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the pool, returning everything it held.
    pub fn drain(&self) -> Vec<C> {
        self.idle()
            .drain(..)
            .map(PooledChannel::into_inner)
            .collect()
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, VecDeque<PooledChannel<C>>> {
        // The critical sections above cannot panic halfway through a mutation.
        self.idle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
