// Copyright 2026 Oxide Computer Company
//! Bounded, pollable, ownership-transferring channel.
//!
//! Items travel through a `std::sync::mpsc::sync_channel`, so a `send` blocks
//! once `capacity` items are waiting.  Alongside it an eventfd in semaphore
//! mode counts what is available to read: one token per item, plus a single
//! close token posted when the last [`Sender`] goes away.  A [`Receiver`]
//! therefore becomes readable (in the `poll(2)` sense) exactly when a `recv`
//! would not block, which is what lets the reactor wait on inbound work and
//! kernel completions with one call.
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::mpsc::{self, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::transport::{Closed, Sink, Source};

struct Inlet<T> {
    // Taken in drop so the channel is disconnected before the close token.
    tx: Option<SyncSender<T>>,
    efd: Arc<EventFd>,
}

impl<T> Drop for Inlet<T> {
    fn drop(&mut self) {
        drop(self.tx.take());
        post(&self.efd);
    }
}

/// Sending half.  Clones share one underlying sender; the channel closes
/// when the last clone is dropped.
pub struct Sender<T> {
    inlet: Arc<Inlet<T>>,
}

/// Receiving half.  Clones compete for items; every clone observes
/// end-of-stream once the channel is closed and drained.
pub struct Receiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    efd: Arc<EventFd>,
}

/// Creates a channel that holds at most `capacity` unreceived items.
///
/// # Panics
/// `capacity` must be at least 1.
pub fn bounded<T>(capacity: usize) -> nix::Result<(Sender<T>, Receiver<T>)> {
    assert!(capacity > 0, "channel capacity must be non-zero");
    let efd = Arc::new(EventFd::from_value_and_flags(
        0,
        EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_SEMAPHORE,
    )?);
    let (tx, rx) = mpsc::sync_channel(capacity);

    let sender = Sender {
        inlet: Arc::new(Inlet {
            tx: Some(tx),
            efd: efd.clone(),
        }),
    };
    let receiver = Receiver {
        rx: Arc::new(Mutex::new(rx)),
        efd,
    };
    Ok((sender, receiver))
}

fn post(efd: &EventFd) {
    loop {
        match efd.write(1) {
            Ok(_) => return,
            Err(Errno::EINTR) => continue,
            Err(e) => panic!("channel eventfd write failed: {e}"),
        }
    }
}

fn take(efd: &EventFd) {
    loop {
        match efd.read() {
            Ok(_) => return,
            Err(Errno::EINTR) => continue,
            Err(e) => panic!("channel eventfd read failed: {e}"),
        }
    }
}

impl<T> Sender<T> {
    /// Hands `item` to the channel, blocking while it is full.  Fails only
    /// when every receiver has been dropped.
    pub fn send(&self, item: T) -> Result<(), Closed<T>> {
        let Some(tx) = self.inlet.tx.as_ref() else {
            unreachable!("sender used during drop");
        };
        tx.send(item).map_err(|e| Closed(e.0))?;
        post(&self.inlet.efd);
        Ok(())
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender {
            inlet: self.inlet.clone(),
        }
    }
}

impl<T> Receiver<T> {
    /// Blocks until an item arrives or the channel is closed and empty.
    pub fn recv(&self) -> Option<T> {
        take(&self.efd);
        let rx = self.rx.lock().expect("channel lock poisoned");
        match rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Disconnected) => {
                // Put the close token back for the next reader.
                post(&self.efd);
                None
            }
            Err(TryRecvError::Empty) => {
                panic!("channel token with nothing behind it")
            }
        }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver {
            rx: self.rx.clone(),
            efd: self.efd.clone(),
        }
    }
}

impl<T> AsFd for Receiver<T> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.efd.as_fd()
    }
}

impl<T: Send> Source<T> for Receiver<T> {
    fn recv(&self) -> Option<T> {
        Receiver::recv(self)
    }
}

impl<T: Send> Sink<T> for Sender<T> {
    fn send(&self, item: T) -> Result<(), Closed<T>> {
        Sender::send(self, item)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::thread;
    use std::time::Duration;

    fn readable<T>(rx: &Receiver<T>) -> bool {
        let mut fds = [PollFd::new(rx.as_fd(), PollFlags::POLLIN)];
        let n = poll(&mut fds, PollTimeout::ZERO).unwrap();
        n == 1
            && fds[0]
                .revents()
                .unwrap()
                .contains(PollFlags::POLLIN)
    }

    #[test]
    fn items_arrive_in_order() {
        let (tx, rx) = bounded(4).unwrap();
        for i in 0..4u32 {
            tx.send(i).unwrap();
        }
        drop(tx);
        let got: Vec<u32> = std::iter::from_fn(|| rx.recv()).collect();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn readiness_tracks_contents() {
        let (tx, rx) = bounded::<u32>(2).unwrap();
        assert!(!readable(&rx));
        tx.send(7).unwrap();
        assert!(readable(&rx));
        assert_eq!(rx.recv(), Some(7));
        assert!(!readable(&rx));

        // Close is a readable event too, and stays readable.
        drop(tx);
        assert!(readable(&rx));
        assert_eq!(rx.recv(), None);
        assert!(readable(&rx));
    }

    #[test]
    fn close_waits_for_last_sender() {
        let (tx, rx) = bounded::<u32>(2).unwrap();
        let tx2 = tx.clone();
        drop(tx);
        assert!(!readable(&rx));
        tx2.send(1).unwrap();
        drop(tx2);
        assert_eq!(rx.recv(), Some(1));
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn every_receiver_sees_close() {
        let (tx, rx) = bounded::<u32>(1).unwrap();
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let rx = rx.clone();
                thread::spawn(move || {
                    let mut n = 0;
                    while rx.recv().is_some() {
                        n += 1;
                    }
                    n
                })
            })
            .collect();
        drop(rx);

        for i in 0..100 {
            tx.send(i).unwrap();
        }
        drop(tx);

        let total: usize = readers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn send_after_receivers_gone_returns_item() {
        let (tx, rx) = bounded::<String>(1).unwrap();
        drop(rx);
        let err = tx.send("lost".to_string()).unwrap_err();
        assert_eq!(err.into_inner(), "lost");
    }

    #[test]
    fn full_channel_blocks_sender() {
        let (tx, rx) = bounded::<u32>(1).unwrap();
        tx.send(0).unwrap();
        let h = thread::spawn(move || {
            // Blocks until the reader makes room.
            tx.send(1).unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!h.is_finished());
        assert_eq!(rx.recv(), Some(0));
        h.join().unwrap();
        assert_eq!(rx.recv(), Some(1));
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn boxed_items_move_through() {
        let (tx, rx) = bounded::<Box<[u8; 4096]>>(2).unwrap();
        let mut b = Box::new([0u8; 4096]);
        b[17] = 42;
        let addr = &*b as *const _ as usize;
        tx.send(b).unwrap();
        let b = thread::spawn(move || rx.recv().unwrap()).join().unwrap();
        assert_eq!(b[17], 42);
        // Moved, not copied.
        assert_eq!(&*b as *const _ as usize, addr);
    }

    #[test]
    #[should_panic(expected = "channel lock poisoned")]
    fn poisoned_lock_names_the_channel() {
        let (tx, rx) = bounded::<u32>(2).unwrap();
        tx.send(3).unwrap();
        let shared = rx.rx.clone();
        let _ = thread::spawn(move || {
            let _held = shared.lock();
            panic!("reader died holding the channel");
        })
        .join();
        rx.recv();
    }
}
