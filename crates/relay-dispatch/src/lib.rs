//! Main-thread dispatch plumbing for the relaychat scripting layer.
//!
//! The chat host runs a single event-loop thread and offers exactly one
//! cross-thread primitive: enqueueing a zero-delay, one-shot callback onto
//! its timer queue. This crate binds that primitive behind [`set_scheduler`],
//! records the event-loop thread identity, and provides the one-slot
//! blocking channel that carries call outcomes back to worker threads.

use thiserror::Error;

pub mod spawn;

pub use spawn::{
    ScheduleFunc, SimpleExecutor, SpawnFunc, enqueue_on_main, is_main_thread,
    is_scheduler_configured, mark_main_thread, set_scheduler,
};

/// Failure reading or writing a one-slot outcome channel.
#[derive(Debug, Error)]
pub enum SlotError {
    /// The producing side went away without delivering an outcome.
    #[error("outcome producer disconnected before delivering a result")]
    Disconnected,
    /// A bounded wait elapsed before the producer delivered.
    #[error("timed out waiting for outcome")]
    Timeout,
}

/// One-slot blocking channel: a single producer hands exactly one message
/// to a single consumer. Built on a bounded flume channel of capacity 1.
pub mod slot {
    use super::SlotError;
    use std::time::Duration;

    /// Producer half. Consumed by [`SlotSender::send`], so a slot can be
    /// filled at most once by construction.
    pub struct SlotSender<T>(flume::Sender<T>);

    /// Consumer half. [`Slot::take`] consumes the slot.
    pub struct Slot<T>(flume::Receiver<T>);

    /// Create a linked sender/receiver pair.
    pub fn pair<T>() -> (SlotSender<T>, Slot<T>) {
        let (tx, rx) = flume::bounded(1);
        (SlotSender(tx), Slot(rx))
    }

    impl<T> SlotSender<T> {
        /// Deliver the single message. Succeeds even if the consumer has
        /// not started waiting yet; fails only if the consumer is gone.
        pub fn send(self, value: T) -> Result<(), SlotError> {
            self.0.send(value).map_err(|_| SlotError::Disconnected)
        }
    }

    impl<T> Slot<T> {
        /// Block until the producer delivers.
        pub fn take(self) -> Result<T, SlotError> {
            self.0.recv().map_err(|_| SlotError::Disconnected)
        }

        /// Block with an upper bound on the wait.
        pub fn take_timeout(self, wait: Duration) -> Result<T, SlotError> {
            self.0.recv_timeout(wait).map_err(|err| match err {
                flume::RecvTimeoutError::Timeout => SlotError::Timeout,
                flume::RecvTimeoutError::Disconnected => SlotError::Disconnected,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::slot;
    use super::*;
    use std::time::Duration;

    #[test]
    fn send_then_take_delivers_value() {
        let (tx, rx) = slot::pair();
        tx.send(42i32).unwrap();
        assert_eq!(rx.take().unwrap(), 42);
    }

    #[test]
    fn take_blocks_until_producer_sends() {
        let (tx, rx) = slot::pair();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            tx.send("late").unwrap();
        });
        assert_eq!(rx.take().unwrap(), "late");
        handle.join().unwrap();
    }

    #[test]
    fn take_after_producer_dropped_is_disconnected() {
        let (tx, rx) = slot::pair::<i32>();
        drop(tx);
        assert!(matches!(rx.take(), Err(SlotError::Disconnected)));
    }

    #[test]
    fn send_after_consumer_dropped_is_disconnected() {
        let (tx, rx) = slot::pair::<i32>();
        drop(rx);
        assert!(matches!(tx.send(1), Err(SlotError::Disconnected)));
    }

    #[test]
    fn take_timeout_elapses_without_producer() {
        let (tx, rx) = slot::pair::<i32>();
        let result = rx.take_timeout(Duration::from_millis(5));
        assert!(matches!(result, Err(SlotError::Timeout)));
        drop(tx);
    }

    #[test]
    fn take_timeout_returns_value_when_available() {
        let (tx, rx) = slot::pair();
        tx.send(vec![1u8, 2, 3]).unwrap();
        assert_eq!(
            rx.take_timeout(Duration::from_millis(50)).unwrap(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn cross_thread_round_trip() {
        let (tx, rx) = slot::pair();
        let producer = std::thread::spawn(move || {
            tx.send(String::from("from worker")).unwrap();
        });
        assert_eq!(rx.take().unwrap(), "from worker");
        producer.join().unwrap();
    }

    #[test]
    fn slot_error_display() {
        assert_eq!(
            SlotError::Disconnected.to_string(),
            "outcome producer disconnected before delivering a result"
        );
        assert_eq!(SlotError::Timeout.to_string(), "timed out waiting for outcome");
    }
}
