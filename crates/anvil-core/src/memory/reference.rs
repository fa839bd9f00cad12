use crate::util::{PAGE_SIZE, Rng};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Reference fill written to the target region before hammering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataPattern {
    /// Pseudo-random bytes. Every page is generated from `(seed, page index)`
    /// alone.
    Random {
        /// Base seed
        seed: u64,
    },
    /// All zeros (0x00)
    Zero,
    /// All ones (0xFF)
    One,
}

impl std::fmt::Display for DataPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataPattern::Random { seed } => write!(f, "random (seed 0x{:x})", seed),
            DataPattern::Zero => write!(f, "zero"),
            DataPattern::One => write!(f, "one"),
        }
    }
}

/// Generator for the expected content of each page.
///
/// Owns a single generator that is reseeded per page, so the expected bytes
/// of a page never depend on the order pages are visited in.
#[derive(Debug)]
pub struct Reference {
    pattern: DataPattern,
    rng: Rng,
    page: Box<[u8; PAGE_SIZE]>,
}

impl Reference {
    /// Creates the generator for `pattern`.
    pub fn new(pattern: DataPattern) -> Self {
        Reference {
            pattern,
            rng: Rng::from_seed(0),
            page: Box::new([0; PAGE_SIZE]),
        }
    }

    /// The fill this reference reproduces.
    pub fn pattern(&self) -> DataPattern {
        self.pattern
    }

    /// Expected content of the page with the given index (offset / PAGE_SIZE).
    pub fn page(&mut self, page_index: usize) -> &[u8; PAGE_SIZE] {
        match self.pattern {
            DataPattern::Random { seed } => {
                self.rng = Rng::from_seed(page_seed(seed, page_index));
                self.rng.fill_bytes(&mut self.page[..]);
            }
            DataPattern::Zero => self.page.fill(0x00),
            DataPattern::One => self.page.fill(0xFF),
        }
        &self.page
    }

    /// Expected byte at `offset` from the region start.
    pub fn byte(&mut self, offset: usize) -> u8 {
        self.page(offset / PAGE_SIZE)[offset % PAGE_SIZE]
    }
}

fn page_seed(seed: u64, page_index: usize) -> u64 {
    seed ^ (page_index as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
