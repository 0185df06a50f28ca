//! A bounded, wait-free single-producer/single-consumer queue.
//!
//! The queue is a ring buffer with two indexes, `head` and `tail`. The
//! producer writes new elements at `tail` and publishes them with a
//! release store; the consumer reads elements at `head` and releases the
//! slot with a release store of its own. Each index lives on its own
//! cache line so the two sides never contend on the same line.
//!
//! Neither side ever blocks or spins: a full queue refuses the element
//! and an empty queue returns `None`. The producer and consumer ends are
//! separate handles, so single-producer/single-consumer use is enforced
//! by ownership rather than by convention.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// Create a queue holding up to `capacity` elements and split it into
/// its producer and consumer ends.
///
/// # Panics
/// Panics if `capacity` is zero.
pub fn channel<T: Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
  assert!(capacity > 0, "queue capacity must be non-zero");

  let queue = Arc::new(Queue::with_capacity(capacity));

  (
    Producer {
      queue: Arc::clone(&queue),
    },
    Consumer { queue },
  )
}

struct Queue<T> {
  head: CachePadded<AtomicUsize>,
  tail: CachePadded<AtomicUsize>,
  // One slot is kept vacant to distinguish a full queue from an empty
  // one, hence capacity + 1 slots.
  slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
  fn with_capacity(capacity: usize) -> Self {
    let slots = (0..capacity + 1)
      .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
      .collect();

    Self {
      head: CachePadded::new(AtomicUsize::new(0)),
      tail: CachePadded::new(AtomicUsize::new(0)),
      slots,
    }
  }

  fn next(&self, index: usize) -> usize {
    let next = index + 1;
    match next == self.slots.len() {
      true => 0,
      false => next,
    }
  }
}

impl<T> Drop for Queue<T> {
  fn drop(&mut self) {
    // Both handles are gone, so the indexes are stable and any elements
    // left between head and tail are still initialized.
    let mut head = self.head.load(Ordering::Relaxed);
    let tail = self.tail.load(Ordering::Relaxed);

    while head != tail {
      unsafe { std::ptr::drop_in_place((*self.slots[head].get()).as_mut_ptr()) };
      head = self.next(head);
    }
  }
}

/// The producing end of a queue. There is exactly one per queue.
pub struct Producer<T> {
  queue: Arc<Queue<T>>,
}

impl<T> Producer<T> {
  /// Place `value` at the tail of the queue.
  ///
  /// Returns the value back if the queue is full. The element is fully
  /// materialized in its slot before the new tail is published, so the
  /// consumer can never observe a partially written element.
  pub fn try_emplace(&mut self, value: T) -> Result<(), T> {
    let queue = &*self.queue;

    let tail = queue.tail.load(Ordering::Relaxed);
    let next_tail = queue.next(tail);
    if next_tail == queue.head.load(Ordering::Acquire) {
      return Err(value);
    }

    // SAFETY: The slot at `tail` is outside the head..tail window, so
    //         the consumer will not touch it until the store below.
    unsafe { (*queue.slots[tail].get()).write(value) };
    queue.tail.store(next_tail, Ordering::Release);

    Ok(())
  }
}

/// The consuming end of a queue. There is exactly one per queue.
pub struct Consumer<T> {
  queue: Arc<Queue<T>>,
}

impl<T> Consumer<T> {
  /// Returns true if the queue holds no elements.
  pub fn is_empty(&self) -> bool {
    let queue = &*self.queue;
    queue.head.load(Ordering::Relaxed) == queue.tail.load(Ordering::Acquire)
  }

  /// Peek at the element at the head of the queue.
  pub fn front(&self) -> Option<&T> {
    let queue = &*self.queue;

    let head = queue.head.load(Ordering::Relaxed);
    if queue.tail.load(Ordering::Acquire) == head {
      return None;
    }

    // SAFETY: head != tail, so the slot at `head` was published by a
    //         release store of `tail` and stays ours until pop().
    Some(unsafe { (*queue.slots[head].get()).assume_init_ref() })
  }

  /// Remove and return the element at the head of the queue.
  pub fn pop(&mut self) -> Option<T> {
    let queue = &*self.queue;

    let head = queue.head.load(Ordering::Relaxed);
    if queue.tail.load(Ordering::Acquire) == head {
      return None;
    }

    // SAFETY: As in front(). The element is moved out before the new
    //         head is published, so the producer cannot overwrite the
    //         slot while we still read from it.
    let value = unsafe { (*queue.slots[head].get()).assume_init_read() };
    queue.head.store(queue.next(head), Ordering::Release);

    Some(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn emplace_and_pop() {
    let (mut tx, mut rx) = channel(128);

    assert!(rx.is_empty());
    assert!(tx.try_emplace(1).is_ok());
    assert!(!rx.is_empty());

    assert_eq!(rx.front(), Some(&1));
    assert_eq!(rx.pop(), Some(1));
    assert_eq!(rx.pop(), None);
    assert!(rx.is_empty());
  }

  #[test]
  fn refuses_when_full() {
    let (mut tx, mut rx) = channel(4);

    for i in 0..4 {
      assert!(tx.try_emplace(i).is_ok());
    }
    assert_eq!(tx.try_emplace(99), Err(99));

    assert_eq!(rx.pop(), Some(0));
    assert!(tx.try_emplace(4).is_ok());
  }

  #[test]
  fn fifo_order() {
    let (mut tx, mut rx) = channel(16);

    for i in 0..10 {
      tx.try_emplace(i).unwrap();
    }
    for i in 0..10 {
      assert_eq!(rx.pop(), Some(i));
    }
  }

  #[test]
  fn drops_undelivered_elements() {
    let value = Arc::new(());
    let (mut tx, rx) = channel(8);

    for _ in 0..5 {
      tx.try_emplace(Arc::clone(&value)).unwrap();
    }
    assert_eq!(Arc::strong_count(&value), 6);

    drop(tx);
    drop(rx);
    assert_eq!(Arc::strong_count(&value), 1);
  }

  #[test]
  fn producer_consumer() {
    const NR_ITERATIONS: usize = 1_000_000;

    let (mut tx, mut rx) = channel(128);

    let producer = std::thread::spawn(move || {
      for i in 0..NR_ITERATIONS {
        loop {
          match tx.try_emplace(i) {
            Ok(()) => break,
            Err(_) => std::hint::spin_loop(),
          }
        }
      }
    });
    let consumer = std::thread::spawn(move || {
      for i in 0..NR_ITERATIONS {
        loop {
          if let Some(item) = rx.pop() {
            assert_eq!(i, item);
            break;
          }
          std::hint::spin_loop();
        }
      }
    });

    producer.join().unwrap();
    consumer.join().unwrap();
  }
}
