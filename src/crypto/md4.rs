//! MD4 hash implementation.
//!
//! MD4 is an obsolete digest that survives only inside MS-CHAPv2, where
//! the NT password hash is MD4 over the UTF-16LE password. Unlike MD5
//! and the SHA family it is little-endian throughout.

/// MD4 block size in bytes.
const BLOCK_SIZE: usize = 64;

/// MD4 digest length in bytes.
pub const DIGEST_LEN: usize = 16;

/// Initial state.
const H0: [u32; 4] = [0x67452301, 0xEFCDAB89, 0x98BADCFE, 0x10325476];

/// Round 2 and round 3 additive constants.
const K2: u32 = 0x5A827999;
const K3: u32 = 0x6ED9EBA1;

/// MD4 hasher.
#[derive(Clone)]
pub struct Md4 {
    state: [u32; 4],
    buffer: [u8; BLOCK_SIZE],
    buffer_len: usize,
    total_len: u64,
}

impl Md4 {
    /// Create a new MD4 hasher.
    pub fn new() -> Self {
        Self {
            state: H0,
            buffer: [0u8; BLOCK_SIZE],
            buffer_len: 0,
            total_len: 0,
        }
    }

    /// Update the hasher with input data.
    pub fn update(&mut self, mut data: &[u8]) {
        self.total_len += data.len() as u64;

        // Fill buffer first
        if self.buffer_len > 0 {
            let space = BLOCK_SIZE - self.buffer_len;
            let to_copy = data.len().min(space);
            self.buffer[self.buffer_len..self.buffer_len + to_copy]
                .copy_from_slice(&data[..to_copy]);
            self.buffer_len += to_copy;
            data = &data[to_copy..];

            if self.buffer_len == BLOCK_SIZE {
                self.process_block(&self.buffer.clone());
                self.buffer_len = 0;
            }
        }

        // Process full blocks
        while data.len() >= BLOCK_SIZE {
            self.process_block(data[..BLOCK_SIZE].try_into().unwrap());
            data = &data[BLOCK_SIZE..];
        }

        // Store remaining bytes
        if !data.is_empty() {
            self.buffer[..data.len()].copy_from_slice(data);
            self.buffer_len = data.len();
        }
    }

    /// Finalize the hash and return the digest.
    pub fn finalize(mut self) -> [u8; DIGEST_LEN] {
        let total_bits = self.total_len * 8;

        // Pad with 0x80
        self.buffer[self.buffer_len] = 0x80;
        self.buffer_len += 1;

        // If not enough space for length, pad and process
        if self.buffer_len > 56 {
            self.buffer[self.buffer_len..].fill(0);
            self.process_block(&self.buffer.clone());
            self.buffer_len = 0;
        }

        // Pad with zeros until length position
        self.buffer[self.buffer_len..56].fill(0);

        // Append length in bits (little-endian, unlike the SHA family)
        self.buffer[56..64].copy_from_slice(&total_bits.to_le_bytes());
        self.process_block(&self.buffer.clone());

        // Extract digest (little-endian words)
        let mut digest = [0u8; DIGEST_LEN];
        for (i, &h) in self.state.iter().enumerate() {
            digest[i * 4..(i + 1) * 4].copy_from_slice(&h.to_le_bytes());
        }
        digest
    }

    /// Process a single 512-bit block.
    fn process_block(&mut self, block: &[u8; BLOCK_SIZE]) {
        let mut x = [0u32; 16];
        for i in 0..16 {
            x[i] = u32::from_le_bytes(block[i * 4..(i + 1) * 4].try_into().unwrap());
        }

        let mut a = self.state[0];
        let mut b = self.state[1];
        let mut c = self.state[2];
        let mut d = self.state[3];

        let f = |x: u32, y: u32, z: u32| (x & y) | (!x & z);
        let g = |x: u32, y: u32, z: u32| (x & y) | (x & z) | (y & z);
        let h = |x: u32, y: u32, z: u32| x ^ y ^ z;

        // Round 1
        for &(k, s) in &[
            (0, 3), (1, 7), (2, 11), (3, 19),
            (4, 3), (5, 7), (6, 11), (7, 19),
            (8, 3), (9, 7), (10, 11), (11, 19),
            (12, 3), (13, 7), (14, 11), (15, 19),
        ] {
            let t = a.wrapping_add(f(b, c, d)).wrapping_add(x[k]).rotate_left(s);
            a = d;
            d = c;
            c = b;
            b = t;
        }

        // Round 2
        for &(k, s) in &[
            (0, 3), (4, 5), (8, 9), (12, 13),
            (1, 3), (5, 5), (9, 9), (13, 13),
            (2, 3), (6, 5), (10, 9), (14, 13),
            (3, 3), (7, 5), (11, 9), (15, 13),
        ] {
            let t = a
                .wrapping_add(g(b, c, d))
                .wrapping_add(x[k])
                .wrapping_add(K2)
                .rotate_left(s);
            a = d;
            d = c;
            c = b;
            b = t;
        }

        // Round 3
        for &(k, s) in &[
            (0, 3), (8, 9), (4, 11), (12, 15),
            (2, 3), (10, 9), (6, 11), (14, 15),
            (1, 3), (9, 9), (5, 11), (13, 15),
            (3, 3), (11, 9), (7, 11), (15, 15),
        ] {
            let t = a
                .wrapping_add(h(b, c, d))
                .wrapping_add(x[k])
                .wrapping_add(K3)
                .rotate_left(s);
            a = d;
            d = c;
            c = b;
            b = t;
        }

        self.state[0] = self.state[0].wrapping_add(a);
        self.state[1] = self.state[1].wrapping_add(b);
        self.state[2] = self.state[2].wrapping_add(c);
        self.state[3] = self.state[3].wrapping_add(d);
    }

    /// Hash data in one call.
    pub fn hash(data: &[u8]) -> [u8; DIGEST_LEN] {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finalize()
    }
}

impl Default for Md4 {
    fn default() -> Self {
        Self::new()
    }
}
