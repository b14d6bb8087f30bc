// MIT License - Copyright (c) 2026 Peter Wright
// Unsolicited frames, queued per sub-device channel

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::time::{Duration, Instant, timeout_at};

use crate::frame::Frame;

/// Frames nobody waited for, split by the channel they belong to.
///
/// Untagged frames belong to the device owning the socket. A frame tagged
/// with a channel id goes to that channel's queue once a sub-device has
/// received on it; until then it lands in the owner's queue. Each queue is
/// bounded and drops its oldest frame when full.
pub struct Inbox {
    queues: Mutex<Queues>,
    arrived: Notify,
    capacity: usize,
}

#[derive(Default)]
struct Queues {
    owner: VecDeque<Frame>,
    channels: HashMap<String, VecDeque<Frame>>,
}

impl Queues {
    fn queue_for(&mut self, frame: &Frame) -> &mut VecDeque<Frame> {
        match frame {
            Frame::Datapoints { cid: Some(cid), .. } if self.channels.contains_key(cid) => {
                self.channels.entry(cid.clone()).or_default()
            }
            _ => &mut self.owner,
        }
    }
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            arrived: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a frame. Returns the frame it displaced when the queue was full.
    pub fn push(&self, frame: Frame) -> Option<Frame> {
        let dropped = {
            let mut queues = self.lock();
            let queue = queues.queue_for(&frame);
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(frame);
            dropped
        };
        self.arrived.notify_waiters();
        dropped
    }

    /// Next frame for `channel` (`None` is the socket owner), if one is queued.
    pub fn pop(&self, channel: Option<&str>) -> Option<Frame> {
        let mut queues = self.lock();
        match channel {
            None => queues.owner.pop_front(),
            Some(cid) => queues.channels.entry(cid.to_string()).or_default().pop_front(),
        }
    }

    /// Wait up to `wait` for a frame on `channel`.
    pub async fn recv(&self, channel: Option<&str>, wait: Duration) -> Option<Frame> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed.
            notified.as_mut().enable();

            if let Some(frame) = self.pop(channel) {
                return Some(frame);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use std::sync::Arc;

    fn dps(index: &str, value: serde_json::Value) -> Map<String, serde_json::Value> {
        let mut dps = Map::new();
        dps.insert(index.into(), value);
        dps
    }

    #[test]
    fn test_untagged_frames_stay_with_owner() {
        let inbox = Inbox::new(8);
        assert!(inbox.pop(Some("c1")).is_none());

        inbox.push(Frame::datapoints(dps("2", json!(100))));
        inbox.push(Frame::error("bad frame"));

        assert!(inbox.pop(Some("c1")).is_none());
        assert_eq!(inbox.pop(None), Some(Frame::datapoints(dps("2", json!(100)))));
        assert_eq!(inbox.pop(None), Some(Frame::error("bad frame")));
    }

    #[test]
    fn test_relayed_frames_follow_their_channel() {
        let inbox = Inbox::new(8);

        // Nobody listens on c2 yet: the owner gets it.
        inbox.push(Frame::relayed(dps("1", json!(true)), "c2"));
        assert!(inbox.pop(Some("c1")).is_none());
        inbox.push(Frame::relayed(dps("1", json!(false)), "c1"));

        assert_eq!(inbox.pop(Some("c1")), Some(Frame::relayed(dps("1", json!(false)), "c1")));
        assert_eq!(inbox.pop(None), Some(Frame::relayed(dps("1", json!(true)), "c2")));
        assert!(inbox.pop(None).is_none());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let inbox = Inbox::new(2);
        for n in 0..3 {
            inbox.push(Frame::datapoints(dps("1", json!(n))));
        }
        assert_eq!(inbox.pop(None), Some(Frame::datapoints(dps("1", json!(1)))));
        assert_eq!(inbox.pop(None), Some(Frame::datapoints(dps("1", json!(2)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_wakes_only_for_own_channel() {
        let inbox = Arc::new(Inbox::new(8));
        inbox.pop(Some("c1"));

        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.recv(Some("c1"), Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        inbox.push(Frame::datapoints(dps("2", json!(100))));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        inbox.push(Frame::relayed(dps("1", json!(true)), "c1"));
        let frame = waiter.await.unwrap();
        assert_eq!(frame, Some(Frame::relayed(dps("1", json!(true)), "c1")));
        assert!(inbox.recv(Some("c1"), Duration::from_millis(10)).await.is_none());
    }
}
