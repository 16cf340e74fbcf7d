// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Representation descriptor: an ordered list of `(multiplicity, l, parity)`
//! entries describing how a feature space decomposes into irreducible
//! representations of the rotation group.

use crate::error::{SE3Error, SE3Result};
use crate::so3;
use serde::{Deserialize, Serialize};
use st_tensor::{PureResult, Tensor};

/// Spatial parity carried by an irreducible block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    Even,
    Odd,
}

/// One `(multiplicity, l, parity)` entry of a representation list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsEntry {
    pub mul: usize,
    pub l: usize,
    pub parity: Option<Parity>,
}

/// A block of the decomposition together with its running channel offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RsBlock {
    pub mul: usize,
    pub l: usize,
    pub parity: Option<Parity>,
    /// First channel index occupied by this block.
    pub offset: usize,
}

impl RsBlock {
    /// Dimension of a single irreducible copy inside the block.
    pub fn irrep_dim(&self) -> usize {
        2 * self.l + 1
    }

    /// Total channel count of the block.
    pub fn dim(&self) -> usize {
        self.mul * self.irrep_dim()
    }
}

/// Ordered, immutable representation list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rs {
    entries: Vec<RsEntry>,
}

impl Rs {
    /// Builds a representation from `(multiplicity, l)` pairs.
    ///
    /// Zero multiplicities are legal and simply contribute no channels; an
    /// empty list is not.
    pub fn new(entries: &[(usize, usize)]) -> SE3Result<Self> {
        Self::from_entries(
            entries
                .iter()
                .map(|&(mul, l)| RsEntry {
                    mul,
                    l,
                    parity: None,
                })
                .collect(),
        )
    }

    /// Builds a representation from `(multiplicity, l, parity)` triples.
    pub fn with_parity(entries: &[(usize, usize, Parity)]) -> SE3Result<Self> {
        Self::from_entries(
            entries
                .iter()
                .map(|&(mul, l, parity)| RsEntry {
                    mul,
                    l,
                    parity: Some(parity),
                })
                .collect(),
        )
    }

    fn from_entries(entries: Vec<RsEntry>) -> SE3Result<Self> {
        if entries.is_empty() {
            return Err(SE3Error::config(
                "representation",
                "representation list must not be empty",
            ));
        }
        Ok(Self { entries })
    }

    /// Raw entries in declaration order.
    pub fn entries(&self) -> &[RsEntry] {
        &self.entries
    }

    /// Total feature dimension `Σ mul · (2l+1)`.
    pub fn dim(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.mul * (2 * entry.l + 1))
            .sum()
    }

    /// Largest `l` among entries with non-zero multiplicity.
    pub fn lmax(&self) -> Option<usize> {
        self.entries
            .iter()
            .filter(|entry| entry.mul > 0)
            .map(|entry| entry.l)
            .max()
    }

    /// Decomposition blocks with running channel offsets.
    pub fn decomposition(&self) -> Vec<RsBlock> {
        let mut offset = 0;
        let mut blocks = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let block = RsBlock {
                mul: entry.mul,
                l: entry.l,
                parity: entry.parity,
                offset,
            };
            offset += block.dim();
            blocks.push(block);
        }
        blocks
    }

    /// Merges consecutive entries with equal `l` and parity, dropping zero
    /// multiplicities.
    pub fn simplify(&self) -> Rs {
        let mut merged: Vec<RsEntry> = Vec::new();
        for entry in self.entries.iter().filter(|entry| entry.mul > 0) {
            match merged.last_mut() {
                Some(last) if last.l == entry.l && last.parity == entry.parity => {
                    last.mul += entry.mul;
                }
                _ => merged.push(*entry),
            }
        }
        if merged.is_empty() {
            // Keep the descriptor non-empty so dim() stays queryable.
            merged.push(RsEntry {
                mul: 0,
                l: 0,
                parity: None,
            });
        }
        Rs { entries: merged }
    }

    /// Block-diagonal real Wigner-D matrix of the whole representation for
    /// Z-Y-Z Euler angles, one `(2l+1)` block per multiplicity copy.
    pub fn rep(&self, alpha: f64, beta: f64, gamma: f64) -> PureResult<Tensor> {
        let dim = self.dim();
        let mut out = Tensor::zeros(dim.max(1), dim.max(1))?;
        let cols = out.shape().1;
        for block in self.decomposition() {
            if block.mul == 0 {
                continue;
            }
            let d = so3::wigner_d_matrix(block.l, alpha, beta, gamma)?;
            let n = block.irrep_dim();
            let d_data = d.data();
            for copy in 0..block.mul {
                let base = block.offset + copy * n;
                for i in 0..n {
                    for j in 0..n {
                        out.data_mut()[(base + i) * cols + (base + j)] = d_data[i * n + j];
                    }
                }
            }
        }
        Ok(out)
    }
}
