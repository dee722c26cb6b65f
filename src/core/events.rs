//! Engine → consumer notifications over a bounded channel.
//!
//! Architecture:
//! - Engine threads (UI render path, decode-ahead worker) only ever `send()`
//! - The consumer drains with `poll()` from whatever context it chooses
//! - No callback is invoked on the sending thread
//!
//! When the queue is full the oldest event is evicted so a stalled consumer
//! never blocks rendering. `MediaEnded` is never lost to eviction: if it is
//! the oldest entry it takes the place of the incoming position update.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, trace};
use std::sync::{Arc, Weak};

/// Notification emitted by the sync engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineEvent {
    /// A render at this master time completed
    PositionChanged(f64),
    /// Decoder reached end of stream (one-shot per load/seek)
    MediaEnded,
}

/// Sending half, cloned into every engine thread
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<EngineEvent>,
    // Receiver clone used only to evict the oldest entry on overflow
    evict: Receiver<EngineEvent>,
    // Dead once every EventReceiver is dropped; `evict` keeps the channel itself open
    consumer: Weak<()>,
}

/// Receiving half owned by the consumer
#[derive(Debug, Clone)]
pub struct EventReceiver {
    rx: Receiver<EngineEvent>,
    _alive: Arc<()>,
}

/// Create a channel holding at most `capacity` undelivered events
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let alive = Arc::new(());
    (
        EventSender { tx, evict: rx.clone(), consumer: Arc::downgrade(&alive) },
        EventReceiver { rx, _alive: alive },
    )
}

impl EventSender {
    /// Queue an event; never blocks
    pub fn send(&self, event: EngineEvent) {
        if self.consumer.strong_count() == 0 {
            trace!("No event consumer, discarding {:?}", event);
            return;
        }
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    event = back;
                    match self.evict.try_recv() {
                        Ok(EngineEvent::MediaEnded) => {
                            if event != EngineEvent::MediaEnded {
                                debug!("Event queue full, dropped {:?} to keep MediaEnded", event);
                            }
                            event = EngineEvent::MediaEnded;
                        }
                        Ok(dropped) => debug!("Event queue full, dropped oldest {:?}", dropped),
                        Err(_) => {}
                    }
                }
                // Consumer gone: nothing to notify
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

impl EventReceiver {
    /// Take all queued events in emission order
    pub fn poll(&self) -> Vec<EngineEvent> {
        self.rx.try_iter().collect()
    }

    /// Block up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<EngineEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_preserves_order() {
        let (tx, rx) = channel(8);
        tx.send(EngineEvent::PositionChanged(1.0));
        tx.send(EngineEvent::PositionChanged(2.0));
        tx.send(EngineEvent::MediaEnded);

        let events = rx.poll();
        assert_eq!(
            events,
            vec![
                EngineEvent::PositionChanged(1.0),
                EngineEvent::PositionChanged(2.0),
                EngineEvent::MediaEnded
            ]
        );
        assert!(rx.poll().is_empty());
    }

    #[test]
    fn test_full_queue_evicts_oldest() {
        let (tx, rx) = channel(2);
        tx.send(EngineEvent::PositionChanged(1.0));
        tx.send(EngineEvent::PositionChanged(2.0));
        tx.send(EngineEvent::PositionChanged(3.0));

        assert_eq!(
            rx.poll(),
            vec![EngineEvent::PositionChanged(2.0), EngineEvent::PositionChanged(3.0)]
        );
    }

    #[test]
    fn test_full_queue_keeps_media_ended() {
        let (tx, rx) = channel(2);
        tx.send(EngineEvent::MediaEnded);
        tx.send(EngineEvent::PositionChanged(1.0));
        tx.send(EngineEvent::PositionChanged(2.0));
        tx.send(EngineEvent::PositionChanged(3.0));

        let events = rx.poll();
        assert_eq!(events.len(), 2);
        assert_eq!(events.iter().filter(|e| **e == EngineEvent::MediaEnded).count(), 1);
    }

    #[test]
    fn test_capacity_one_holds_media_ended() {
        let (tx, rx) = channel(1);
        tx.send(EngineEvent::MediaEnded);
        tx.send(EngineEvent::PositionChanged(4.0));
        assert_eq!(rx.poll(), vec![EngineEvent::MediaEnded]);
        tx.send(EngineEvent::PositionChanged(4.0));
        tx.send(EngineEvent::MediaEnded);
        assert_eq!(rx.poll(), vec![EngineEvent::MediaEnded]);
    }

    #[test]
    fn test_send_after_consumer_dropped_queues_nothing() {
        let (tx, rx) = channel(2);
        let other = rx.clone();
        drop(rx);
        tx.send(EngineEvent::PositionChanged(1.0));
        assert_eq!(other.len(), 1);
        drop(other);
        for i in 0..16 {
            tx.send(EngineEvent::PositionChanged(i as f64));
        }
        assert_eq!(tx.evict.len(), 1);
    }

    #[test]
    fn test_send_from_other_thread() {
        let (tx, rx) = channel(4);
        let handle = std::thread::spawn(move || tx.send(EngineEvent::MediaEnded));
        handle.join().unwrap();
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(1)), Some(EngineEvent::MediaEnded));
    }
}
