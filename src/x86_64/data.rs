// Copyright © 2026 The cpu-model Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Sparse bit sets over CPUID leaves and their set algebra.

use std::io::Write;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// First function number of the extended CPUID leaf range.
pub const CPUX86_EXTENDED: u32 = 0x8000_0000;

/// First function number of the basic CPUID leaf range.
pub const CPUX86_BASIC: u32 = 0x0;

pub(crate) fn serialize_as_hex<S: Serializer>(
    input: &u32,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    // two bytes for "0x" prefix and eight for the hex encoded number
    let mut buffer = [0_u8; 10];
    let _ = write!(&mut buffer[..], "{input:#010x}");
    let str = core::str::from_utf8(&buffer[..])
        .expect("the buffer should be filled with valid UTF-8 bytes");
    serializer.serialize_str(str)
}

pub(crate) fn deserialize_from_hex<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<u32, D::Error> {
    let hex = <&'de str as Deserialize>::deserialize(deserializer)?;
    u32::from_str_radix(hex.strip_prefix("0x").unwrap_or(""), 16).map_err(|_| {
        <D::Error as serde::de::Error>::custom(format!("{hex} is not a hex encoded 32 bit integer"))
    })
}

/// The four output registers of the CPUID instruction for one leaf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuidLeaf {
    #[serde(serialize_with = "serialize_as_hex")]
    #[serde(deserialize_with = "deserialize_from_hex")]
    pub function: u32,
    #[serde(serialize_with = "serialize_as_hex")]
    #[serde(deserialize_with = "deserialize_from_hex")]
    pub eax: u32,
    #[serde(serialize_with = "serialize_as_hex")]
    #[serde(deserialize_with = "deserialize_from_hex")]
    pub ebx: u32,
    #[serde(serialize_with = "serialize_as_hex")]
    #[serde(deserialize_with = "deserialize_from_hex")]
    pub ecx: u32,
    #[serde(serialize_with = "serialize_as_hex")]
    #[serde(deserialize_with = "deserialize_from_hex")]
    pub edx: u32,
}

impl CpuidLeaf {
    /// An empty leaf for the given function number.
    pub fn new(function: u32) -> Self {
        CpuidLeaf {
            function,
            ..Default::default()
        }
    }

    /// An all-zero leaf is equivalent to an absent one.
    pub fn is_empty(&self) -> bool {
        self.eax == 0 && self.ebx == 0 && self.ecx == 0 && self.edx == 0
    }

    /// True when both leaves carry exactly the same register values.
    pub fn matches(&self, other: &CpuidLeaf) -> bool {
        self.eax == other.eax
            && self.ebx == other.ebx
            && self.ecx == other.ecx
            && self.edx == other.edx
    }

    /// True when this leaf covers every bit set in `mask`.
    pub fn matches_masked(&self, mask: &CpuidLeaf) -> bool {
        (self.eax & mask.eax) == mask.eax
            && (self.ebx & mask.ebx) == mask.ebx
            && (self.ecx & mask.ecx) == mask.ecx
            && (self.edx & mask.edx) == mask.edx
    }

    pub fn set_bits(&mut self, mask: &CpuidLeaf) {
        self.eax |= mask.eax;
        self.ebx |= mask.ebx;
        self.ecx |= mask.ecx;
        self.edx |= mask.edx;
    }

    pub fn clear_bits(&mut self, mask: &CpuidLeaf) {
        self.eax &= !mask.eax;
        self.ebx &= !mask.ebx;
        self.ecx &= !mask.ecx;
        self.edx &= !mask.edx;
    }

    pub fn and_bits(&mut self, mask: &CpuidLeaf) {
        self.eax &= mask.eax;
        self.ebx &= mask.ebx;
        self.ecx &= mask.ecx;
        self.edx &= mask.edx;
    }
}

/// A sparse bit set over CPUID leaves.
///
/// Leaves are stored in two dense arrays indexed by function number, split at
/// [`CPUX86_EXTENDED`]. Arrays grow on demand and never shrink; an all-zero
/// entry counts as absent for every set operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct X86Data {
    basic: Vec<CpuidLeaf>,
    extended: Vec<CpuidLeaf>,
}

impl X86Data {
    pub fn new() -> Self {
        X86Data::default()
    }

    /// Returns the stored leaf for `function` if present and non-empty.
    pub fn leaf(&self, function: u32) -> Option<&CpuidLeaf> {
        let (half, index) = if function < CPUX86_EXTENDED {
            (&self.basic, function as usize)
        } else {
            (&self.extended, (function - CPUX86_EXTENDED) as usize)
        };
        half.get(index).filter(|leaf| !leaf.is_empty())
    }

    fn leaf_mut(&mut self, function: u32) -> Option<&mut CpuidLeaf> {
        let (half, index) = if function < CPUX86_EXTENDED {
            (&mut self.basic, function as usize)
        } else {
            (&mut self.extended, (function - CPUX86_EXTENDED) as usize)
        };
        half.get_mut(index).filter(|leaf| !leaf.is_empty())
    }

    /// Grows the two halves so that at least `basic_len` basic and
    /// `extended_len` extended slots exist. New slots are empty but carry
    /// their leaf number.
    fn expand(&mut self, basic_len: usize, extended_len: usize) {
        while self.basic.len() < basic_len {
            self.basic.push(CpuidLeaf::new(self.basic.len() as u32));
        }
        while self.extended.len() < extended_len {
            self.extended
                .push(CpuidLeaf::new(CPUX86_EXTENDED + self.extended.len() as u32));
        }
    }

    /// ORs `leaf`'s registers into the slot for its function number,
    /// materializing the slot first if needed.
    pub fn add_leaf(&mut self, leaf: &CpuidLeaf) {
        if leaf.function < CPUX86_EXTENDED {
            let pos = leaf.function as usize;
            self.expand(pos + 1, 0);
            self.basic[pos].set_bits(leaf);
        } else {
            let pos = (leaf.function - CPUX86_EXTENDED) as usize;
            self.expand(0, pos + 1);
            self.extended[pos].set_bits(leaf);
        }
    }

    /// Set union: bitwise OR per leaf for all leaves of `other`.
    pub fn union_with(&mut self, other: &X86Data) {
        self.expand(other.basic.len(), other.extended.len());
        for (leaf, mask) in self.basic.iter_mut().zip(other.basic.iter()) {
            leaf.set_bits(mask);
        }
        for (leaf, mask) in self.extended.iter_mut().zip(other.extended.iter()) {
            leaf.set_bits(mask);
        }
    }

    /// Set subtraction: bitwise AND-NOT over the overlap of the two arrays.
    ///
    /// Leaves of `other` beyond this set's length are ignored; subtracting a
    /// leaf that is not present here is a no-op.
    pub fn subtract(&mut self, other: &X86Data) {
        for (leaf, mask) in self.basic.iter_mut().zip(other.basic.iter()) {
            leaf.clear_bits(mask);
        }
        for (leaf, mask) in self.extended.iter_mut().zip(other.extended.iter()) {
            leaf.clear_bits(mask);
        }
    }

    /// Set intersection: every non-empty leaf is ANDed with the
    /// same-function leaf of `other`, or cleared when `other` has none.
    pub fn intersect_with(&mut self, other: &X86Data) {
        for leaf in self
            .basic
            .iter_mut()
            .chain(self.extended.iter_mut())
            .filter(|leaf| !leaf.is_empty())
        {
            match other.leaf(leaf.function) {
                Some(mask) => leaf.and_bits(mask),
                None => *leaf = CpuidLeaf::new(leaf.function),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// True when every non-empty leaf of `part` is covered by the
    /// same-function leaf here.
    pub fn covers(&self, part: &X86Data) -> bool {
        part.iter()
            .all(|sub| matches!(self.leaf(sub.function), Some(leaf) if leaf.matches_masked(sub)))
    }

    /// Yields all non-empty leaves, basic ascending then extended ascending.
    pub fn iter(&self) -> impl Iterator<Item = &CpuidLeaf> {
        self.basic
            .iter()
            .chain(self.extended.iter())
            .filter(|leaf| !leaf.is_empty())
    }

    /// Removes the bits of `mask` from the same-function leaf, returning
    /// true when that leaf was present and covered the whole mask.
    pub(crate) fn strip_masked(&mut self, mask: &CpuidLeaf) -> bool {
        match self.leaf_mut(mask.function) {
            Some(leaf) if leaf.matches_masked(mask) => {
                leaf.clear_bits(mask);
                true
            }
            _ => false,
        }
    }
}
