//! Fixed-capacity append buffers backed by a process-wide free pool.
//!
//! Connections hold small scratch buffers only while they are mid-parse
//! (header assembly, control payloads, request lines). Instead of
//! allocating per connection, [`OnDemandBuffer`] claims a [`PooledBuffer`]
//! from a size-keyed pool on first write and returns it on clear, so idle
//! connections cost nothing. The pool is sharded (one free list per size
//! class) and bounded, so it never grows past a fixed ceiling.

use std::sync::OnceLock;

use dashmap::DashMap;

/// Free-list ceiling per size class.
const POOL_PER_SIZE: usize = 64;

fn pool() -> &'static DashMap<usize, Vec<Box<[u8]>>> {
    static POOL: OnceLock<DashMap<usize, Vec<Box<[u8]>>>> = OnceLock::new();
    POOL.get_or_init(DashMap::new)
}

/// Number of free buffers currently pooled for `cap`. Test hook.
pub fn pooled_count(cap: usize) -> usize {
    pool().get(&cap).map(|v| v.len()).unwrap_or(0)
}

/// A fixed-capacity append buffer. `add` never grows the allocation and
/// reports how many bytes were actually copied.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl PooledBuffer {
    /// Claim a buffer of exactly `cap` bytes, reusing a pooled one if
    /// available.
    pub fn acquire(cap: usize) -> Self {
        let data = pool()
            .get_mut(&cap)
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| vec![0u8; cap].into_boxed_slice());
        Self { data, len: 0 }
    }

    /// Return the buffer to its size class. Dropped instead once the free
    /// list holds [`POOL_PER_SIZE`] entries.
    pub fn recycle(self) {
        let cap = self.data.len();
        let mut free = pool().entry(cap).or_default();
        if free.len() < POOL_PER_SIZE {
            free.push(self.data);
        }
    }

    /// Append as much of `src` as fits. Returns the number of bytes copied.
    pub fn add(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.len() - self.len);
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Marker error: buffering the input would exceed the configured capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

/// A buffer that materialises only when a parse actually spans chunks.
///
/// The central pattern is [`add_and_test`](OnDemandBuffer::add_and_test):
/// run a parser over the logical concatenation of any buffered prefix and
/// the new chunk. If the parser succeeds the buffer is released back to the
/// pool; if it needs more input the whole chunk is buffered for next time.
#[derive(Debug)]
pub struct OnDemandBuffer {
    cap: usize,
    buf: Option<PooledBuffer>,
}

impl OnDemandBuffer {
    pub fn new(cap: usize) -> Self {
        Self { cap, buf: None }
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map(PooledBuffer::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change the capacity for future claims. Only permitted while empty.
    pub fn set_capacity(&mut self, cap: usize) -> bool {
        if self.buf.is_some() {
            return false;
        }
        self.cap = cap;
        true
    }

    /// Release any held buffer back to the pool.
    pub fn clear(&mut self) {
        if let Some(b) = self.buf.take() {
            b.recycle();
        }
    }

    /// Buffered bytes, empty when nothing is held.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_ref().map(PooledBuffer::as_slice).unwrap_or(&[])
    }

    /// Append unconditionally, claiming a buffer on first write.
    pub fn add(&mut self, data: &[u8]) -> std::result::Result<(), Overflow> {
        if data.is_empty() {
            return Ok(());
        }
        if self.len() + data.len() > self.cap {
            return Err(Overflow);
        }
        let b = self.buf.get_or_insert_with(|| PooledBuffer::acquire(self.cap));
        b.add(data);
        Ok(())
    }

    /// Feed `data` through `test`, buffering across calls as needed.
    ///
    /// `test` sees the logical concatenation of the buffered prefix and
    /// `data`; it returns `Some((result, consumed))` with `consumed`
    /// counting from the start of that concatenation, or `None` for "need
    /// more bytes". On success the buffer is released and
    /// `Ok(Some((result, n)))` reports `n` bytes consumed *from `data`*.
    /// On "need more", `data` is buffered in its entirety; `Err(Overflow)`
    /// if that would exceed the capacity.
    pub fn add_and_test<R>(
        &mut self,
        data: &[u8],
        test: impl FnOnce(&[u8]) -> Option<(R, usize)>,
    ) -> std::result::Result<Option<(R, usize)>, Overflow> {
        match self.buf.take() {
            None => match test(data) {
                Some((r, consumed)) => Ok(Some((r, consumed))),
                None => {
                    if data.len() > self.cap {
                        return Err(Overflow);
                    }
                    let mut b = PooledBuffer::acquire(self.cap);
                    b.add(data);
                    self.buf = Some(b);
                    Ok(None)
                }
            },
            Some(mut b) => {
                let prior = b.len();
                let copied = b.add(data);
                match test(b.as_slice()) {
                    Some((r, consumed)) => {
                        b.recycle();
                        // The buffered prefix was a strict incomplete parse,
                        // so a successful parse always reaches into `data`.
                        Ok(Some((r, consumed.saturating_sub(prior))))
                    }
                    None => {
                        if copied < data.len() {
                            b.recycle();
                            return Err(Overflow);
                        }
                        self.buf = Some(b);
                        Ok(None)
                    }
                }
            }
        }
    }
}

impl Drop for OnDemandBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}
