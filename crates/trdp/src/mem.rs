//! Telegram memory accounting.
//!
//! Embedded deployments give the stack a fixed memory budget at init and
//! expect allocation failure to surface as an error code, never as an
//! abort or a silent shrink. Buffers themselves are ordinary heap
//! allocations; this module keeps the *ledger*: every telegram or session
//! buffer is charged to the budget rounded up to a power-of-two block
//! size, and released when the owning entry is dropped. An optional
//! pre-fragmentation vector reserves block counts per size class up
//! front, mirroring pools that are carved at boot.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, TrdpError};

/// Number of block size classes: powers of two from 32 to 524288.
pub const NUM_BLOCK_SIZES: usize = 15;

/// Smallest block size.
pub const MIN_BLOCK_SIZE: usize = 32;

/// Largest block size.
pub const MAX_BLOCK_SIZE: usize = MIN_BLOCK_SIZE << (NUM_BLOCK_SIZES - 1);

/// Memory configuration supplied at init.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemConfig {
    /// Total budget in bytes.
    pub size: usize,
    /// Blocks to reserve per size class (32, 64, ... 524288).
    pub prealloc: [u32; NUM_BLOCK_SIZES],
}

impl Default for MemConfig {
    fn default() -> Self {
        MemConfig {
            size: 1 << 20,
            prealloc: [0; NUM_BLOCK_SIZES],
        }
    }
}

/// Size class for a byte count, as `(index, block_size)`.
fn block_class(size: usize) -> Result<(usize, usize)> {
    if size > MAX_BLOCK_SIZE {
        return Err(TrdpError::Mem {
            requested: size,
            available: MAX_BLOCK_SIZE,
        });
    }
    let block = size.max(MIN_BLOCK_SIZE).next_power_of_two();
    Ok((block.trailing_zeros() as usize - MIN_BLOCK_SIZE.trailing_zeros() as usize, block))
}

#[derive(Debug)]
struct Ledger {
    /// Unreserved budget still free.
    free: usize,
    /// Reserved blocks still available, per size class.
    reserved: [u32; NUM_BLOCK_SIZES],
    used: usize,
    high_water: usize,
    failures: u64,
}

/// The shared memory ledger for a registry of sessions.
#[derive(Debug)]
pub struct MemPool {
    inner: Mutex<Ledger>,
}

impl MemPool {
    /// Set up the ledger. Fails when the pre-fragmentation vector does
    /// not fit the budget.
    pub fn new(config: &MemConfig) -> Result<Arc<Self>> {
        let reserve_total: usize = config
            .prealloc
            .iter()
            .enumerate()
            .map(|(i, &count)| (MIN_BLOCK_SIZE << i) * count as usize)
            .sum();
        if reserve_total > config.size {
            return Err(TrdpError::Init(format!(
                "pre-fragmentation needs {reserve_total} bytes, budget is {}",
                config.size
            )));
        }
        Ok(Arc::new(MemPool {
            inner: Mutex::new(Ledger {
                free: config.size - reserve_total,
                reserved: config.prealloc,
                used: 0,
                high_water: 0,
                failures: 0,
            }),
        }))
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        // The ledger holds plain counters; a panicking holder cannot
        // leave them torn.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Charge `size` bytes to the budget, rounded up to its block size.
    ///
    /// The charge is released when the returned token drops.
    pub fn alloc(self: &Arc<Self>, size: usize) -> Result<MemCharge> {
        let (class, block) = block_class(size)?;
        let mut ledger = self.ledger();
        let from_reserve = if ledger.reserved[class] > 0 {
            ledger.reserved[class] -= 1;
            true
        } else if ledger.free >= block {
            ledger.free -= block;
            false
        } else {
            ledger.failures += 1;
            return Err(TrdpError::Mem {
                requested: block,
                available: ledger.free,
            });
        };
        ledger.used += block;
        ledger.high_water = ledger.high_water.max(ledger.used);
        Ok(MemCharge {
            pool: Arc::clone(self),
            class,
            block,
            from_reserve,
        })
    }

    /// Bytes currently charged.
    pub fn used(&self) -> usize {
        self.ledger().used
    }

    /// Peak bytes charged since init.
    pub fn high_water(&self) -> usize {
        self.ledger().high_water
    }

    /// Failed allocations since init.
    pub fn failures(&self) -> u64 {
        self.ledger().failures
    }

    fn release(&self, class: usize, block: usize, from_reserve: bool) {
        let mut ledger = self.ledger();
        if from_reserve {
            ledger.reserved[class] += 1;
        } else {
            ledger.free += block;
        }
        ledger.used -= block;
    }
}

/// An outstanding charge against a [`MemPool`].
#[derive(Debug)]
pub struct MemCharge {
    pool: Arc<MemPool>,
    class: usize,
    block: usize,
    from_reserve: bool,
}

impl MemCharge {
    /// The bin-rounded size of this charge.
    pub fn block_size(&self) -> usize {
        self.block
    }
}

impl Drop for MemCharge {
    fn drop(&mut self) {
        self.pool.release(self.class, self.block, self.from_reserve);
    }
}
