//! Round-robin write tokens.
//!
//! `T` dump threads prepare buffers in parallel but must hit the output file
//! strictly in block order. Each thread owns one token of a ring; it blocks
//! on [`Token::wait`] until its turn, writes, then calls [`Token::pass`] to
//! wake exactly its successor. This is a linear chain of condvar handoffs,
//! not a scheduler.

use std::sync::{Arc, Condvar, Mutex};

struct TokenState {
    active: Mutex<bool>,
    cond: Condvar,
}

pub struct TokenRing {
    states: Vec<Arc<TokenState>>,
}

/// One thread's handle: its own state plus its successor's.
pub struct Token {
    me: Arc<TokenState>,
    next: Arc<TokenState>,
}

impl TokenRing {
    /// A ring of `n` tokens; token 0 starts active.
    pub fn new(n: usize) -> TokenRing {
        assert!(n >= 1);
        let states: Vec<Arc<TokenState>> = (0..n)
            .map(|i| {
                Arc::new(TokenState {
                    active: Mutex::new(i == 0),
                    cond: Condvar::new(),
                })
            })
            .collect();
        TokenRing { states }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// The handle for thread `i`.
    pub fn token(&self, i: usize) -> Token {
        Token {
            me: Arc::clone(&self.states[i]),
            next: Arc::clone(&self.states[(i + 1) % self.states.len()]),
        }
    }

    /// Rearm the ring for another dump: token 0 active, everyone else idle.
    /// Only valid while no thread is waiting.
    pub fn reset(&self) {
        for (i, s) in self.states.iter().enumerate() {
            *s.active.lock().unwrap() = i == 0;
        }
    }
}

impl Token {
    /// Block until this token becomes active, consuming the activation.
    pub fn wait(&self) {
        let mut active = self.me.active.lock().unwrap();
        while !*active {
            active = self.me.cond.wait(active).unwrap();
        }
        *active = false;
    }

    /// Activate the successor token and wake its owner.
    pub fn pass(&self) {
        let mut next_active = self.next.active.lock().unwrap();
        *next_active = true;
        self.next.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn tokens_serialize_in_ring_order() {
        let threads = 4;
        let rounds = 25;
        let ring = TokenRing::new(threads);
        let order = Mutex::new(Vec::new());
        let passes = AtomicUsize::new(0);

        thread::scope(|s| {
            for t in 0..threads {
                let token = ring.token(t);
                let order = &order;
                let passes = &passes;
                s.spawn(move || {
                    for _ in 0..rounds {
                        token.wait();
                        order.lock().unwrap().push(t);
                        passes.fetch_add(1, Ordering::Relaxed);
                        token.pass();
                    }
                });
            }
        });

        let order = order.into_inner().unwrap();
        assert_eq!(order.len(), threads * rounds);
        for (i, &t) in order.iter().enumerate() {
            assert_eq!(t, i % threads, "ring order violated at step {}", i);
        }
    }

    #[test]
    fn reset_rearms_token_zero() {
        let ring = TokenRing::new(2);
        let t0 = ring.token(0);
        let t1 = ring.token(1);
        t0.wait();
        t0.pass();
        t1.wait();
        // ring now fully idle; reset makes token 0 runnable again
        ring.reset();
        t0.wait();
        t0.pass();
    }
}
