//! Bitmap data structure helper, used as member-index ack sets.

use std::fmt;

use crate::utils::PalfError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for member index -> bool mapping. The bitmap size is the
/// size of the membership it tracks, so majority checks need no other input.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new bitmap of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    pub fn new(size: usize, ones: bool) -> Self {
        let mut bitset = FixedBitSet::with_capacity(size);
        if ones {
            bitset.set_range(.., true);
        }
        Bitmap(bitset)
    }

    /// Creates a new bitmap of given size from a list of indices to be set.
    pub fn from(size: usize, ones: &[usize]) -> Result<Self, PalfError> {
        let mut bitmap = Self::new(size, false);
        for &idx in ones {
            bitmap.set(idx, true)?;
        }
        Ok(bitmap)
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(&mut self, idx: usize, flag: bool) -> Result<(), PalfError> {
        if idx >= self.0.len() {
            return Err(PalfError::msg(format!("index {} out of bound", idx)));
        }
        self.0.set(idx, flag);
        Ok(())
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: usize) -> Result<bool, PalfError> {
        if idx >= self.0.len() {
            return Err(PalfError::msg(format!("index {} out of bound", idx)));
        }
        Ok(self.0[idx])
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.len()
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones(..)
    }

    /// True if strictly more than half of the slots are set. An empty bitmap
    /// never has a majority.
    #[inline]
    pub fn has_majority(&self) -> bool {
        self.size() > 0 && self.count() * 2 > self.size()
    }

    /// Clears all bits to false.
    #[inline]
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Allows `for (idx, bit) in map.iter()`.
    #[inline]
    pub fn iter(&self) -> BitmapIter {
        BitmapIter { map: self, idx: 0 }
    }
}

/// Iterator over `Bitmap`, yielding `(idx, bit)` pairs.
#[derive(Debug, Clone)]
pub struct BitmapIter<'m> {
    map: &'m Bitmap,
    idx: usize,
}

impl Iterator for BitmapIter<'_> {
    type Item = (usize, bool);

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx < self.map.size() {
            let idx = self.idx;
            self.idx += 1;
            Some((idx, self.map.0[idx]))
        } else {
            None
        }
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        let mut first_idx = true;
        for i in self
            .iter()
            .filter_map(|(i, flag)| if flag { Some(i) } else { None })
        {
            if !first_idx {
                write!(f, ", {}", i)?;
            } else {
                write!(f, "{}", i)?;
                first_idx = false;
            }
        }
        write!(f, "]}}")
    }
}
