use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};

/// Exponential backoff for flight retransmission (RFC 6347 §4.2.4).
///
/// Starts at the configured initial timeout and doubles on every attempt
/// until the retry budget is spent.
#[derive(Debug)]
pub struct ExponentialBackoff {
    start_timeout: Duration,
    retries: usize,
    timeout: Duration,
    left: usize,
}

impl ExponentialBackoff {
    pub fn new(start_timeout: Duration, retries: usize) -> Self {
        Self {
            start_timeout,
            retries,
            timeout: start_timeout,
            left: retries,
        }
    }

    pub fn reset(&mut self) {
        self.timeout = self.start_timeout;
        self.left = self.retries;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn attempt(&mut self) {
        let (n, overflow) = self.left.overflowing_sub(1);

        if overflow {
            return;
        }

        self.left = n;
        self.timeout *= 2;
    }

    pub fn can_retry(&self) -> bool {
        self.left > 0
    }
}

enum Control {
    Schedule {
        deadline: Instant,
        peer: SocketAddr,
        generation: u64,
    },
    Shutdown,
}

struct Entry {
    deadline: Instant,
    peer: SocketAddr,
    generation: u64,
}

// Heap order: deadline, then generation. The peer does not participate.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Schedules flight retransmissions on a dedicated thread.
///
/// Cancellation is generation based: replacing or dropping a flight bumps
/// the connection's flight generation, so a deadline scheduled for the old
/// flight fires as a no-op in the callback. This removes the need for a
/// per-flight cancellable task handle.
pub struct RetransmitTimer {
    control: Sender<Control>,
    handle: Option<JoinHandle<()>>,
}

impl RetransmitTimer {
    pub fn spawn<F>(on_timeout: F) -> Self
    where
        F: Fn(SocketAddr, u64) + Send + 'static,
    {
        let (tx, rx) = unbounded::<Control>();

        let handle = std::thread::Builder::new()
            .name("dconn-timer".into())
            .spawn(move || {
                let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();

                loop {
                    let now = Instant::now();

                    // Fire everything that is due
                    while let Some(Reverse(head)) = heap.peek() {
                        if head.deadline > now {
                            break;
                        }
                        // Unwrap is ok, peek just returned Some.
                        let Reverse(entry) = heap.pop().unwrap();
                        on_timeout(entry.peer, entry.generation);
                    }

                    let message = match heap.peek() {
                        Some(Reverse(head)) => {
                            let wait = head.deadline.saturating_duration_since(now);
                            match rx.recv_timeout(wait) {
                                Ok(m) => m,
                                Err(RecvTimeoutError::Timeout) => continue,
                                Err(RecvTimeoutError::Disconnected) => return,
                            }
                        }
                        None => match rx.recv() {
                            Ok(m) => m,
                            Err(_) => return,
                        },
                    };

                    match message {
                        Control::Schedule {
                            deadline,
                            peer,
                            generation,
                        } => {
                            heap.push(Reverse(Entry {
                                deadline,
                                peer,
                                generation,
                            }));
                        }
                        Control::Shutdown => return,
                    }
                }
            })
            .expect("spawn timer thread");

        RetransmitTimer {
            control: tx,
            handle: Some(handle),
        }
    }

    pub fn schedule(&self, delay: Duration, peer: SocketAddr, generation: u64) {
        let _ = self.control.send(Control::Schedule {
            deadline: Instant::now() + delay,
            peer,
            generation,
        });
    }

    pub fn shutdown(mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RetransmitTimer {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
