use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

/// Fixed table of reentrant advisory locks, one per stripe.
///
/// A chain is locked through the stripe its start address hashes to, so the
/// table never grows no matter how many blocks the store has handed out.
/// Unrelated chains sharing a stripe only contend with each other.
pub struct LockTable {
    stripes: Vec<Stripe>,
}

struct Stripe {
    owner: Mutex<Option<(ThreadId, usize)>>,
    released: Condvar,
}

impl LockTable {
    pub fn new(stripes: usize) -> Self {
        let stripes = (0..stripes.max(1))
            .map(|_| Stripe {
                owner: Mutex::new(None),
                released: Condvar::new(),
            })
            .collect();
        Self { stripes }
    }

    pub fn stripes(&self) -> usize {
        self.stripes.len()
    }

    fn stripe_of(&self, address: u64) -> usize {
        // Fibonacci hashing spreads block-aligned addresses across stripes.
        let mixed = address.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
        (mixed % self.stripes.len() as u64) as usize
    }

    /// Blocks until the stripe covering `address` is free or already held by
    /// the calling thread.
    pub fn lock(self: &Arc<Self>, address: u64) -> BlockGuard {
        let index = self.stripe_of(address);
        let stripe = &self.stripes[index];
        let me = thread::current().id();

        let mut owner = stripe.owner.lock().unwrap();
        loop {
            match owner.map(|(holder, _)| holder) {
                None => {
                    *owner = Some((me, 1));
                    break;
                }
                Some(holder) if holder == me => {
                    if let Some((_, depth)) = owner.as_mut() {
                        *depth += 1;
                    }
                    break;
                }
                Some(_) => owner = stripe.released.wait(owner).unwrap(),
            }
        }

        BlockGuard {
            table: Arc::clone(self),
            stripe: index,
        }
    }

    fn unlock(&self, index: usize) {
        let stripe = &self.stripes[index];
        let mut owner = stripe.owner.lock().unwrap();
        let released = match owner.as_mut() {
            Some((_, depth)) => {
                *depth -= 1;
                *depth == 0
            }
            None => false,
        };
        if released {
            *owner = None;
            stripe.released.notify_one();
        }
    }
}

/// Holds one stripe of a [`LockTable`] until dropped.
pub struct BlockGuard {
    table: Arc<LockTable>,
    stripe: usize,
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        self.table.unlock(self.stripe);
    }
}
