use crate::error::{PlacementError, Result};
use crate::mutations::SequencePosition;
use serde::{Deserialize, Serialize};

/// A nucleotide as a 4-bit one-hot mask. Sets of nucleotides are expressed as unions of these
/// masks, and [`NUC_N`] (all four bits) denotes an ambiguous or missing call.
pub type Nucleotide = u8;

pub const NUC_A: Nucleotide = 0b0001;
pub const NUC_C: Nucleotide = 0b0010;
pub const NUC_G: Nucleotide = 0b0100;
pub const NUC_T: Nucleotide = 0b1000;
pub const NUC_N: Nucleotide = 0b1111;

/// Whether `nuc` encodes exactly one nucleotide
#[inline]
pub fn is_one_hot(nuc: Nucleotide) -> bool {
    nuc != 0 && nuc & (nuc - 1) == 0 && nuc <= NUC_T
}

/// Parse a FASTA nucleotide character. Only unambiguous bases and `N` are accepted; other IUPAC
/// codes are reported as `None`.
pub fn nuc_from_char(c: char) -> Option<Nucleotide> {
    match c.to_ascii_uppercase() {
        'A' => Some(NUC_A),
        'C' => Some(NUC_C),
        'G' => Some(NUC_G),
        'T' => Some(NUC_T),
        'N' => Some(NUC_N),
        _ => None,
    }
}

/// Render a one-hot nucleotide. Anything that is not exactly one base is rendered as `N`.
pub fn nuc_to_char(nuc: Nucleotide) -> char {
    match nuc {
        NUC_A => 'A',
        NUC_C => 'C',
        NUC_G => 'G',
        NUC_T => 'T',
        _ => 'N',
    }
}

/// The reference genome the tree is rooted in, stored one one-hot nucleotide per base.
/// Positions are 1-based, matching the positions of [`crate::mutations::Mutation`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSequence {
    bases: Vec<Nucleotide>,
}

impl ReferenceSequence {
    /// Parse a reference from a nucleotide string, e.g. the concatenated lines of a FASTA record.
    pub fn parse(sequence: &str) -> Result<Self> {
        let bases = sequence
            .chars()
            .filter(|c| !c.is_whitespace())
            .enumerate()
            .map(|(i, c)| {
                nuc_from_char(c).ok_or_else(|| {
                    PlacementError::malformed("reference", format!("invalid base {c:?} at {}", i + 1))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { bases })
    }

    pub fn from_bases(bases: Vec<Nucleotide>) -> Self {
        Self { bases }
    }

    /// Length of the genome in bases
    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    /// Whether the 1-based position lies within the reference
    pub fn contains(&self, position: SequencePosition) -> bool {
        position.unwrap() >= 1 && position.unwrap() as usize <= self.bases.len()
    }

    /// Reference allele at a 1-based position, or `None` outside of the reference.
    pub fn get(&self, position: SequencePosition) -> Option<Nucleotide> {
        if self.contains(position) {
            Some(self.bases[position.unwrap() as usize - 1])
        } else {
            None
        }
    }

    /// Reference allele at a position that has already been validated against the reference.
    /// Out-of-range positions yield [`NUC_N`].
    pub(crate) fn get_unchecked(&self, position: SequencePosition) -> Nucleotide {
        self.get(position).unwrap_or(NUC_N)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_hot_detection() {
        assert!(is_one_hot(NUC_A));
        assert!(is_one_hot(NUC_T));
        assert!(!is_one_hot(NUC_N));
        assert!(!is_one_hot(NUC_A | NUC_G));
        assert!(!is_one_hot(0));
        assert!(!is_one_hot(0b1_0000));
    }

    #[test]
    fn reference_positions_are_one_based() {
        let reference = ReferenceSequence::parse("ACG\nT").unwrap();
        assert_eq!(reference.len(), 4);
        assert_eq!(reference.get(SequencePosition::from_usize(1)), Some(NUC_A));
        assert_eq!(reference.get(SequencePosition::from_usize(4)), Some(NUC_T));
        assert_eq!(reference.get(SequencePosition::from_usize(0)), None);
        assert_eq!(reference.get(SequencePosition::from_usize(5)), None);
    }

    #[test]
    fn reference_rejects_iupac_codes() {
        assert!(ReferenceSequence::parse("ACRT").is_err());
    }
}
