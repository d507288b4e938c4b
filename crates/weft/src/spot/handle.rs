// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Spot handles: per-subscriber view over a [`SpotNode`](super::SpotNode).

use super::NodeInner;
use crate::socket::Msg;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One publisher/subscriber handle multiplexed over a spot node.
///
/// Receives block on the node's condition variable; `try_recv` gives the
/// non-blocking form. Dropping the handle (or calling [`Spot::destroy`])
/// releases its subscriptions and queued messages.
pub struct Spot {
    node: Arc<NodeInner>,
    id: u64,
    detached: AtomicBool,
}

impl Spot {
    pub(crate) fn new(node: Arc<NodeInner>, id: u64) -> Spot {
        Spot {
            node,
            id,
            detached: AtomicBool::new(false),
        }
    }

    fn check_live(&self) -> Result<()> {
        if self.detached.load(Ordering::Acquire) {
            Err(Error::StaleHandle)
        } else {
            Ok(())
        }
    }

    /// Publish to a topic: dispatched to local subscribers and broadcast to
    /// peer nodes.
    pub fn publish(&self, topic: &str, parts: Vec<Msg>) -> Result<()> {
        self.check_live()?;
        self.node.publish(topic, parts)
    }

    /// Subscribe to an exact topic.
    pub fn subscribe(&self, topic: &str) -> Result<()> {
        self.check_live()?;
        self.node.subscribe(self.id, topic)
    }

    /// Subscribe to a trailing-`*` pattern (e.g. `log.*`).
    pub fn subscribe_pattern(&self, pattern: &str) -> Result<()> {
        self.check_live()?;
        self.node.subscribe_pattern(self.id, pattern)
    }

    /// Drop an exact-topic or pattern subscription.
    pub fn unsubscribe(&self, topic_or_pattern: &str) -> Result<()> {
        self.check_live()?;
        self.node.unsubscribe(self.id, topic_or_pattern)
    }

    /// Create a topic through this handle.
    pub fn topic_create(&self, topic: &str, mode: super::TopicMode) -> Result<()> {
        self.check_live()?;
        self.node.topic_create(topic, mode)
    }

    /// Destroy a topic through this handle.
    pub fn topic_destroy(&self, topic: &str) -> Result<()> {
        self.check_live()?;
        self.node.topic_destroy(topic)
    }

    fn recv_inner(&self, timeout: Option<Duration>) -> Result<(String, Vec<Msg>)> {
        self.check_live()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.node.state.lock();
        loop {
            if self.node.stop.load(Ordering::Acquire) {
                return Err(Error::Terminated);
            }
            if !st.spots.contains_key(&self.id) {
                return Err(Error::StaleHandle);
            }
            if let Some(message) = take_message(&mut st, self.id) {
                return Ok(message);
            }
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(if timeout == Some(Duration::ZERO) {
                            Error::WouldBlock
                        } else {
                            Error::TimedOut
                        });
                    }
                    self.node.cv.wait_for(&mut st, d - now);
                }
                None => {
                    self.node.cv.wait(&mut st);
                }
            }
        }
    }

    /// Receive the next message for this handle, blocking indefinitely.
    pub fn recv(&self) -> Result<(String, Vec<Msg>)> {
        self.recv_inner(None)
    }

    /// Non-blocking receive; `WouldBlock` when nothing is queued.
    pub fn try_recv(&self) -> Result<(String, Vec<Msg>)> {
        self.recv_inner(Some(Duration::ZERO))
    }

    /// Bounded receive; `TimedOut` on expiry.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<(String, Vec<Msg>)> {
        self.recv_inner(Some(timeout))
    }

    /// Detach from the node, dropping subscriptions and queued messages.
    pub fn destroy(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        self.node.remove_spot(self.id);
        self.node.cv.notify_all();
    }
}

impl Drop for Spot {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Pop the next message for a slot: FIFO queue first, then ring cursors.
fn take_message(st: &mut super::NodeState, spot_id: u64) -> Option<(String, Vec<Msg>)> {
    if let Some(slot) = st.spots.get_mut(&spot_id) {
        if let Some(shared) = slot.queue.pop_front() {
            return Some((shared.topic.clone(), shared.parts.clone()));
        }
    }

    let super::NodeState { spots, topics, .. } = &mut *st;
    let slot = spots.get_mut(&spot_id)?;
    for (topic, cursor) in slot.ring_cursors.iter_mut() {
        let Some(state) = topics.get(topic) else {
            continue;
        };
        if state.mode != super::TopicMode::Ringbuffer {
            continue;
        }
        if *cursor < state.ring.start_seq {
            *cursor = state.ring.start_seq;
        }
        let end = state.ring.start_seq + state.ring.entries.len() as u64;
        if *cursor >= end {
            continue;
        }
        let index = (*cursor - state.ring.start_seq) as usize;
        let parts = state.ring.entries[index].as_ref().clone();
        *cursor += 1;
        return Some((topic.clone(), parts));
    }
    None
}
