//! Cyclic-polynomial (buzhash) rolling hash over a fixed byte window.
//!
//! Each byte maps to a 64-bit value from a fixed table. Sliding the window
//! rotates the running hash by one bit, cancels the outgoing byte (rotated by
//! the window length) and mixes in the incoming byte. The table is generated
//! at compile time from a fixed seed, so boundaries are stable across builds.

/// Byte-to-value table, generated with splitmix64.
static TABLE: [u64; 256] = build_table(0x7465_7373_6572_6121);

const fn build_table(seed: u64) -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state = seed;
    let mut i = 0;
    while i < 256 {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        table[i] = z ^ (z >> 31);
        i += 1;
    }
    table
}

/// Rolling hash over the last `window` bytes fed to it.
#[derive(Debug, Clone)]
pub struct RollingHash {
    window: Vec<u8>,
    pos: usize,
    filled: bool,
    out_rotation: u32,
    hash: u64,
}

impl RollingHash {
    /// Create a rolling hash with the given window length.
    ///
    /// # Panics
    ///
    /// Panics if `window` is zero.
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "rolling hash window must be > 0");
        Self {
            window: vec![0; window],
            pos: 0,
            filled: false,
            out_rotation: (window % 64) as u32,
            hash: 0,
        }
    }

    /// Forget all bytes seen so far.
    pub fn reset(&mut self) {
        self.window.fill(0);
        self.pos = 0;
        self.filled = false;
        self.hash = 0;
    }

    /// Feed one byte and return the updated hash.
    #[inline]
    pub fn roll(&mut self, byte: u8) -> u64 {
        let mut hash = self.hash.rotate_left(1) ^ TABLE[byte as usize];
        if self.filled {
            let out = self.window[self.pos];
            hash ^= TABLE[out as usize].rotate_left(self.out_rotation);
        }

        self.window[self.pos] = byte;
        self.pos += 1;
        if self.pos == self.window.len() {
            self.pos = 0;
            self.filled = true;
        }

        self.hash = hash;
        hash
    }

    /// Current hash value.
    pub fn value(&self) -> u64 {
        self.hash
    }

    /// Window length in bytes.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }
}
