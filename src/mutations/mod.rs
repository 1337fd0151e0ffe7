use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::dna::{nuc_to_char, Nucleotide, NUC_N};

pub mod staged;

pub use staged::{RawMutation, StagedMutation, StagedMutations};

/// A 1-based position in the reference genome.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct SequencePosition(u32);

impl SequencePosition {
    /// Position of the terminating record of a [`StagedMutations`] list. It compares greater than
    /// every genomic position.
    pub const SENTINEL: SequencePosition = SequencePosition(u32::MAX);

    /// Create a new sequence position from a usize.
    pub fn from_usize(position: usize) -> Self {
        Self(position as u32)
    }

    pub(crate) fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Get the underlying value of the sequence position.
    pub fn unwrap(&self) -> u32 {
        self.0
    }
}

impl From<u32> for SequencePosition {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Display for SequencePosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single allele change on a tree branch.
///
/// Alleles are one-hot [`Nucleotide`]s. A mutant allele of [`NUC_N`] marks a placeholder for a
/// position where the sample below carries no information. The descendant alleles are the union
/// of the mutant alleles found at this position in the subtree below the branch, including this
/// mutation itself.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Mutation {
    chromosome: u8,
    position: SequencePosition,
    reference: Nucleotide,
    parent: Nucleotide,
    mutant: Nucleotide,
    descendants: Nucleotide,
}

impl Mutation {
    pub fn new(
        chromosome: u8,
        position: SequencePosition,
        reference: Nucleotide,
        parent: Nucleotide,
        mutant: Nucleotide,
    ) -> Self {
        Self {
            chromosome,
            position,
            reference,
            parent,
            mutant,
            descendants: mutant,
        }
    }

    pub fn chromosome(&self) -> u8 {
        self.chromosome
    }

    pub fn position(&self) -> SequencePosition {
        self.position
    }

    /// Reference allele at the position
    pub fn reference(&self) -> Nucleotide {
        self.reference
    }

    /// Allele above the branch
    pub fn parent(&self) -> Nucleotide {
        self.parent
    }

    /// Allele below the branch
    pub fn mutant(&self) -> Nucleotide {
        self.mutant
    }

    pub fn descendant_alleles(&self) -> Nucleotide {
        self.descendants
    }

    pub(crate) fn set_parent(&mut self, parent: Nucleotide) {
        self.parent = parent;
    }

    pub(crate) fn set_descendant_alleles(&mut self, alleles: Nucleotide) {
        self.descendants = alleles;
    }

    /// Whether this mutation is a substitution rather than a placeholder that is compatible with
    /// its parent allele.
    #[inline]
    pub fn is_substitution(&self) -> bool {
        self.parent & self.mutant == 0
    }

    /// Whether the mutant allele is unknown
    #[inline]
    pub fn is_ambiguous(&self) -> bool {
        self.mutant == NUC_N
    }
}

impl Display for Mutation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            nuc_to_char(self.parent),
            self.position,
            nuc_to_char(self.mutant)
        )
    }
}

/// Branch length of a mutation list: the number of substitutions, placeholders excluded.
pub fn count_substitutions(mutations: &[Mutation]) -> u32 {
    mutations.iter().filter(|m| m.is_substitution()).count() as u32
}

/// Whether positions are strictly increasing, i.e. sorted without duplicates.
pub fn is_strictly_sorted(mutations: &[Mutation]) -> bool {
    mutations
        .windows(2)
        .all(|pair| pair[0].position() < pair[1].position())
}

/// Find the mutation at a position in a sorted mutation list.
pub fn find_position(mutations: &[Mutation], position: SequencePosition) -> Option<&Mutation> {
    mutations
        .binary_search_by(|m| m.position().cmp(&position))
        .ok()
        .map(|i| &mutations[i])
}

/// Combine the mutations of a branch with the mutations of the branch directly below it, as if the
/// node between them were removed. Both lists must be sorted. Where both branches mutate the same
/// position, the upper parent allele and the lower mutant allele are kept, and the result is
/// dropped entirely if it no longer changes the allele.
pub fn merge_branches(upper: &[Mutation], lower: &[Mutation]) -> Vec<Mutation> {
    let mut merged = Vec::with_capacity(upper.len() + lower.len());
    let mut upper_iter = upper.iter().peekable();
    let mut lower_iter = lower.iter().peekable();

    loop {
        let next = match (upper_iter.peek(), lower_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => upper_iter.next().cloned(),
            (None, Some(_)) => lower_iter.next().cloned(),
            (Some(u), Some(l)) => match u.position().cmp(&l.position()) {
                Ordering::Less => upper_iter.next().cloned(),
                Ordering::Greater => lower_iter.next().cloned(),
                Ordering::Equal => {
                    let parent = u.parent();
                    upper_iter.next();
                    lower_iter.next().map(|l| {
                        let mut combined = l.clone();
                        combined.set_parent(parent);
                        combined
                    })
                }
            },
        };

        if let Some(mutation) = next {
            if mutation.parent() != mutation.mutant() {
                merged.push(mutation);
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dna::{NUC_A, NUC_C, NUC_G, NUC_T};

    fn mutation(position: u32, parent: Nucleotide, mutant: Nucleotide) -> Mutation {
        Mutation::new(0, position.into(), NUC_A, parent, mutant)
    }

    #[test]
    fn placeholders_are_not_substitutions() {
        let muts = vec![
            mutation(1, NUC_A, NUC_T),
            mutation(2, NUC_A, NUC_N),
            mutation(3, NUC_C, NUC_G),
        ];
        assert_eq!(count_substitutions(&muts), 2);
        assert!(muts[1].is_ambiguous());
        assert_eq!(muts[0].to_string(), "A1T");
    }

    #[test]
    fn sortedness_rejects_duplicates() {
        assert!(is_strictly_sorted(&[mutation(1, NUC_A, NUC_T), mutation(5, NUC_A, NUC_T)]));
        assert!(!is_strictly_sorted(&[mutation(5, NUC_A, NUC_T), mutation(5, NUC_T, NUC_C)]));
        assert!(!is_strictly_sorted(&[mutation(6, NUC_A, NUC_T), mutation(5, NUC_T, NUC_C)]));
    }

    #[test]
    fn merging_branches_composes_alleles() {
        let upper = vec![mutation(1, NUC_A, NUC_T), mutation(4, NUC_A, NUC_G)];
        let lower = vec![
            mutation(1, NUC_T, NUC_C),
            mutation(3, NUC_A, NUC_C),
            mutation(4, NUC_G, NUC_A),
        ];
        let merged = merge_branches(&upper, &lower);

        // position 4 returns to its original allele and disappears
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].position().unwrap(), 1);
        assert_eq!(merged[0].parent(), NUC_A);
        assert_eq!(merged[0].mutant(), NUC_C);
        assert_eq!(merged[1].position().unwrap(), 3);
        assert!(is_strictly_sorted(&merged));
    }

    #[test]
    fn find_position_in_sorted_list() {
        let muts = vec![mutation(2, NUC_A, NUC_T), mutation(8, NUC_A, NUC_G)];
        assert_eq!(find_position(&muts, 8.into()).map(|m| m.mutant()), Some(NUC_G));
        assert!(find_position(&muts, 3.into()).is_none());
    }
}
