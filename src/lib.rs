//! A lock-free unbounded multi-producer multi-consumer FIFO queue that
//! reclaims memory with split reference counting.
//!
//! The queue is a single building block: a Michael–Scott style linked list
//! whose nodes are freed the moment the last structural link and the last
//! in-flight reader are gone, without a garbage collector, epochs, or locks.
//!
//! # Examples
//!
//! Single producer, single consumer:
//!
//! ```
//! use refq::LockFreeQueue;
//!
//! let queue: LockFreeQueue<usize> = LockFreeQueue::new();
//!
//! for i in 0..100 {
//!     queue.push(i);
//! }
//! for i in 0..100 {
//!     assert_eq!(queue.pop(), Some(i));
//! }
//! assert!(queue.pop().is_none());
//! ```
//!
//! Multiple producers, multiple consumers:
//!
//! ```
//! use refq::LockFreeQueue;
//! use std::sync::Arc;
//! use std::thread;
//!
//! const COUNT: usize = 100;
//! const THREADS: usize = 4;
//!
//! let queue = Arc::new(LockFreeQueue::new());
//!
//! let producers: Vec<_> = (0..THREADS)
//!     .map(|t| {
//!         let queue = Arc::clone(&queue);
//!         thread::spawn(move || {
//!             for i in 0..COUNT {
//!                 queue.push(t * COUNT + i);
//!             }
//!         })
//!     })
//!     .collect();
//! let consumers: Vec<_> = (0..THREADS)
//!     .map(|_| {
//!         let queue = Arc::clone(&queue);
//!         thread::spawn(move || {
//!             let mut got = 0;
//!             while got < COUNT {
//!                 if queue.pop().is_some() {
//!                     got += 1;
//!                 }
//!             }
//!         })
//!     })
//!     .collect();
//!
//! for handle in producers.into_iter().chain(consumers) {
//!     handle.join().unwrap();
//! }
//! assert!(queue.pop().is_none());
//! ```

pub mod structures;

pub(crate) mod sync;

pub use structures::lock_free_queue::LockFreeQueue;
