//! Square binary matrices over GF(2).
//!
//! The table's hash function is `h = M * m` where `M` is a random invertible
//! square matrix of side `key_len`. Storing `M` and its inverse lets the
//! array keep only the bits of `h` that the slot position does not already
//! imply, and reconstruct full keys during iteration.
//!
//! A matrix is stored column-major: `columns[0]` is the column multiplied by
//! the most significant bit of the input vector.

use std::fmt;
use std::io::{self, Read, Write};

use rand::Rng;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum MatrixError {
    /// Gauss-Jordan elimination found the matrix to have rank < size.
    Singular,
    /// A serialized matrix declared an unusable size.
    InvalidSize(i32),
    /// Truncated or unreadable serialized form.
    Io(io::Error),
}

impl fmt::Display for MatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatrixError::Singular => write!(f, "matrix is singular"),
            MatrixError::InvalidSize(s) => {
                write!(f, "invalid matrix size '{}'. Must be between 1 and 64", s)
            }
            MatrixError::Io(e) => write!(f, "error reading matrix: {}", e),
        }
    }
}

impl std::error::Error for MatrixError {}

impl From<io::Error> for MatrixError {
    fn from(e: io::Error) -> Self {
        MatrixError::Io(e)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SquareMatrix
// ─────────────────────────────────────────────────────────────────────────────

/// A `size x size` binary matrix, `1 <= size <= 64`.
#[derive(Clone, PartialEq, Eq)]
pub struct SquareMatrix {
    columns: Vec<u64>,
    size: usize,
}

impl SquareMatrix {
    /// All-zero matrix of the given side.
    pub fn new(size: usize) -> SquareMatrix {
        assert!(size >= 1 && size <= 64, "matrix size out of range: {}", size);
        SquareMatrix {
            columns: vec![0; size],
            size,
        }
    }

    /// Identity matrix of the given side.
    pub fn identity(size: usize) -> SquareMatrix {
        let mut m = SquareMatrix::new(size);
        let mut v = m.msb();
        for c in m.columns.iter_mut() {
            *c = v;
            v >>= 1;
        }
        m
    }

    #[inline]
    fn mask(&self) -> u64 {
        if self.size >= 64 {
            u64::MAX
        } else {
            (1u64 << self.size) - 1
        }
    }

    #[inline]
    fn msb(&self) -> u64 {
        1u64 << (self.size - 1)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_identity(&self) -> bool {
        let mut v = self.msb();
        for &c in &self.columns {
            if c != v {
                return false;
            }
            v >>= 1;
        }
        true
    }

    // ── Multiplication ──────────────────────────────────────────────────────

    /// Matrix-vector product over GF(2). Only the low `size` bits of `v`
    /// participate.
    #[inline]
    pub fn times(&self, v: u64) -> u64 {
        let mut v = v & self.mask();
        let mut res = 0u64;
        // Each set bit of v (LSB first) selects a column from the right end.
        let mut ci = self.size;
        while v != 0 {
            ci -= 1;
            res ^= (v & 1).wrapping_neg() & self.columns[ci];
            v >>= 1;
        }
        res
    }

    /// Matrix-matrix product over GF(2).
    pub fn multiply(&self, other: &SquareMatrix) -> SquareMatrix {
        assert_eq!(
            self.size, other.size,
            "matrix multiplication dimension mismatch"
        );
        let mut res = SquareMatrix::new(self.size);
        for (rc, &oc) in res.columns.iter_mut().zip(other.columns.iter()) {
            *rc = self.times(oc);
        }
        res
    }

    // ── Randomization and inversion ─────────────────────────────────────────

    /// Fill with random bits.
    pub fn randomize<R: Rng>(&mut self, rng: &mut R) {
        let mask = self.mask();
        for c in self.columns.iter_mut() {
            *c = rng.gen::<u64>() & mask;
        }
    }

    /// Gauss-Jordan inversion over GF(2). Fails with
    /// [`MatrixError::Singular`] when the rank is deficient.
    pub fn inverse(&self) -> Result<SquareMatrix, MatrixError> {
        let size = self.size;
        let mut pivot = self.clone();
        let mut res = SquareMatrix::identity(size);

        // forward elimination
        for i in 0..size {
            let row_bit = (size - i - 1) as u32;
            if (pivot.columns[i] >> row_bit) & 1 == 0 {
                let j = (i + 1..size)
                    .find(|&j| (pivot.columns[j] >> row_bit) & 1 == 1)
                    .ok_or(MatrixError::Singular)?;
                pivot.columns[i] ^= pivot.columns[j];
                res.columns[i] ^= res.columns[j];
            }
            for j in i + 1..size {
                if (pivot.columns[j] >> row_bit) & 1 == 1 {
                    pivot.columns[j] ^= pivot.columns[i];
                    res.columns[j] ^= res.columns[i];
                }
            }
        }

        // backward elimination
        for i in (1..size).rev() {
            let row_bit = (size - i - 1) as u32;
            for j in (0..i).rev() {
                if (pivot.columns[j] >> row_bit) & 1 == 1 {
                    pivot.columns[j] ^= pivot.columns[i];
                    res.columns[j] ^= res.columns[i];
                }
            }
        }
        Ok(res)
    }

    /// Re-randomize until invertible; returns the inverse. A random square
    /// matrix over GF(2) is invertible with probability ~0.29, so this
    /// terminates after a handful of attempts.
    pub fn randomize_pseudo_inverse<R: Rng>(&mut self, rng: &mut R) -> SquareMatrix {
        loop {
            self.randomize(rng);
            if let Ok(inv) = self.inverse() {
                return inv;
            }
        }
    }

    // ── Serialization: i32 size then `size` column words, little-endian ─────

    /// Number of bytes [`SquareMatrix::dump`] writes.
    pub fn dump_size(&self) -> usize {
        4 + 8 * self.size
    }

    pub fn dump<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&(self.size as i32).to_le_bytes())?;
        for &c in &self.columns {
            out.write_all(&c.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn load<R: Read>(input: &mut R) -> Result<SquareMatrix, MatrixError> {
        let mut szb = [0u8; 4];
        input.read_exact(&mut szb)?;
        let size = i32::from_le_bytes(szb);
        if size <= 0 || size > 64 {
            return Err(MatrixError::InvalidSize(size));
        }
        let mut m = SquareMatrix::new(size as usize);
        let mut wb = [0u8; 8];
        for c in m.columns.iter_mut() {
            input.read_exact(&mut wb)?;
            *c = u64::from_le_bytes(wb);
        }
        Ok(m)
    }

    /// Deserialize from a byte slice; returns the matrix and the number of
    /// bytes consumed.
    pub fn read(map: &[u8]) -> Result<(SquareMatrix, usize), MatrixError> {
        let mut cursor = map;
        let m = SquareMatrix::load(&mut cursor)?;
        let used = m.dump_size();
        Ok((m, used))
    }
}

impl fmt::Debug for SquareMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}x{}", self.size, self.size)?;
        let mut row = self.msb();
        while row != 0 {
            for &c in &self.columns {
                write!(f, "{}", if c & row != 0 { 1 } else { 0 })?;
            }
            writeln!(f)?;
            row >>= 1;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn identity_times_is_noop() {
        for size in [1usize, 7, 32, 63, 64] {
            let id = SquareMatrix::identity(size);
            assert!(id.is_identity());
            let v = 0xDEAD_BEEF_CAFE_F00Du64 & id.mask();
            assert_eq!(id.times(v), v);
        }
    }

    #[test]
    fn inverse_of_identity() {
        let id = SquareMatrix::identity(16);
        assert!(id.inverse().unwrap().is_identity());
    }

    #[test]
    fn singular_detected() {
        // Two identical non-zero columns cannot have full rank.
        let mut m = SquareMatrix::new(4);
        m.columns = vec![0b1000, 0b1000, 0b0010, 0b0001];
        assert!(matches!(m.inverse(), Err(MatrixError::Singular)));
    }

    #[test]
    fn random_inverse_round_trips_vectors() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for size in [8usize, 31, 48, 64] {
            let mut m = SquareMatrix::new(size);
            let inv = m.randomize_pseudo_inverse(&mut rng);
            assert!(m.multiply(&inv).is_identity());
            for _ in 0..100 {
                let v = rng.gen::<u64>() & m.mask();
                assert_eq!(inv.times(m.times(v)), v);
            }
        }
    }

    #[test]
    fn serialization_round_trip() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut m = SquareMatrix::new(34);
        m.randomize(&mut rng);
        let mut buf = Vec::new();
        m.dump(&mut buf).unwrap();
        assert_eq!(buf.len(), m.dump_size());
        let (back, used) = SquareMatrix::read(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(back, m);
    }

    #[test]
    fn bad_size_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(65i32).to_le_bytes());
        assert!(matches!(
            SquareMatrix::read(&buf),
            Err(MatrixError::InvalidSize(65))
        ));
    }
}
