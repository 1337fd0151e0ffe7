use crate::dna::{is_one_hot, Nucleotide, ReferenceSequence, NUC_N};
use crate::error::{PlacementError, Result};
use crate::mutations::SequencePosition;

/// A sample record as supplied by the caller. Substitutions are relative to the reference genome,
/// missing ranges are inclusive on both ends.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RawMutation {
    Substitution {
        chromosome: u8,
        position: SequencePosition,
        parent: Nucleotide,
        mutant: Nucleotide,
    },
    Missing {
        chromosome: u8,
        start: SequencePosition,
        end: SequencePosition,
    },
}

impl RawMutation {
    fn start(&self) -> SequencePosition {
        match self {
            RawMutation::Substitution { position, .. } => *position,
            RawMutation::Missing { start, .. } => *start,
        }
    }

    fn end(&self) -> SequencePosition {
        match self {
            RawMutation::Substitution { position, .. } => *position,
            RawMutation::Missing { end, .. } => *end,
        }
    }
}

/// A discretization input record. Either a concrete allele change whose parent allele is already
/// known, or a range of positions without information.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagedMutation {
    Substitution {
        chromosome: u8,
        position: SequencePosition,
        parent: Nucleotide,
        mutant: Nucleotide,
    },
    Missing {
        chromosome: u8,
        start: SequencePosition,
        end: SequencePosition,
    },
    /// Terminates every staged list
    Sentinel,
}

impl StagedMutation {
    /// First position covered by the record
    pub fn position(&self) -> SequencePosition {
        match self {
            StagedMutation::Substitution { position, .. } => *position,
            StagedMutation::Missing { start, .. } => *start,
            StagedMutation::Sentinel => SequencePosition::SENTINEL,
        }
    }

    /// Last position covered by the record (inclusive)
    pub fn end(&self) -> SequencePosition {
        match self {
            StagedMutation::Substitution { position, .. } => *position,
            StagedMutation::Missing { end, .. } => *end,
            StagedMutation::Sentinel => SequencePosition::SENTINEL,
        }
    }
}

/// A position-sorted, non-overlapping list of staged records, always terminated by
/// [`StagedMutation::Sentinel`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedMutations(Vec<StagedMutation>);

impl StagedMutations {
    /// Validate a sample's raw records against the reference and stage them. Adjacent missing
    /// positions are merged into a single range.
    ///
    /// # Errors
    /// - [`PlacementError::PositionOutOfRange`] if a record leaves the reference
    /// - [`PlacementError::MalformedSample`] if records are unsorted or overlap, if an allele is
    /// not one-hot, if a parent allele disagrees with the reference, or if a substitution does not
    /// change the allele
    pub fn stage(sample: &str, raw: &[RawMutation], reference: &ReferenceSequence) -> Result<Self> {
        let mut staged: Vec<StagedMutation> = Vec::with_capacity(raw.len() + 1);
        let mut last_end: Option<SequencePosition> = None;

        for record in raw {
            for position in [record.start(), record.end()] {
                if !reference.contains(position) {
                    return Err(PlacementError::PositionOutOfRange {
                        sample: sample.to_string(),
                        position: position.unwrap(),
                        reference_len: reference.len(),
                    });
                }
            }
            if record.end() < record.start() {
                return Err(PlacementError::malformed(
                    sample,
                    format!("range {}-{} ends before it starts", record.start(), record.end()),
                ));
            }
            if let Some(last_end) = last_end {
                if record.start() <= last_end {
                    return Err(PlacementError::malformed(
                        sample,
                        format!("record at {} is unsorted or overlaps", record.start()),
                    ));
                }
            }
            last_end = Some(record.end());

            let next = match *record {
                RawMutation::Substitution {
                    chromosome,
                    position,
                    mutant: NUC_N,
                    ..
                } => StagedMutation::Missing {
                    chromosome,
                    start: position,
                    end: position,
                },
                RawMutation::Substitution {
                    chromosome,
                    position,
                    parent,
                    mutant,
                } => {
                    if !is_one_hot(parent) || !is_one_hot(mutant) {
                        return Err(PlacementError::malformed(
                            sample,
                            format!("alleles at {position} are not single nucleotides"),
                        ));
                    }
                    if reference.get(position) != Some(parent) {
                        return Err(PlacementError::malformed(
                            sample,
                            format!("parent allele at {position} disagrees with the reference"),
                        ));
                    }
                    if parent == mutant {
                        return Err(PlacementError::malformed(
                            sample,
                            format!("record at {position} does not change the allele"),
                        ));
                    }
                    StagedMutation::Substitution {
                        chromosome,
                        position,
                        parent,
                        mutant,
                    }
                }
                RawMutation::Missing {
                    chromosome,
                    start,
                    end,
                } => StagedMutation::Missing {
                    chromosome,
                    start,
                    end,
                },
            };

            // extend the previous range instead of starting an adjacent one
            if let (
                Some(StagedMutation::Missing {
                    chromosome: prev_chromosome,
                    end: prev_end,
                    ..
                }),
                StagedMutation::Missing {
                    chromosome,
                    start,
                    end,
                },
            ) = (staged.last_mut(), next)
            {
                if *prev_chromosome == chromosome && prev_end.next() == start {
                    *prev_end = end;
                    continue;
                }
            }
            staged.push(next);
        }

        staged.push(StagedMutation::Sentinel);
        Ok(Self(staged))
    }

    /// Terminate an already sorted list of records.
    pub(crate) fn from_sorted(mut records: Vec<StagedMutation>) -> Self {
        debug_assert!(records
            .windows(2)
            .all(|pair| pair[0].end() < pair[1].position()));
        debug_assert!(!matches!(records.last(), Some(StagedMutation::Sentinel)));
        records.push(StagedMutation::Sentinel);
        Self(records)
    }

    /// All records including the terminating sentinel
    pub fn as_slice(&self) -> &[StagedMutation] {
        &self.0
    }

    /// All records without the terminating sentinel
    pub fn records(&self) -> &[StagedMutation] {
        &self.0[..self.0.len() - 1]
    }

    /// Iterate over the concrete records as `(chromosome, position, parent, mutant)`
    pub fn substitutions(
        &self,
    ) -> impl Iterator<Item = (u8, SequencePosition, Nucleotide, Nucleotide)> + '_ {
        self.0.iter().filter_map(|record| match *record {
            StagedMutation::Substitution {
                chromosome,
                position,
                parent,
                mutant,
            } => Some((chromosome, position, parent, mutant)),
            _ => None,
        })
    }

    /// Iterate over the missing ranges as `(chromosome, start, end)`
    pub fn missing_ranges(
        &self,
    ) -> impl Iterator<Item = (u8, SequencePosition, SequencePosition)> + '_ {
        self.0.iter().filter_map(|record| match *record {
            StagedMutation::Missing {
                chromosome,
                start,
                end,
            } => Some((chromosome, start, end)),
            _ => None,
        })
    }

    /// Number of concrete records
    pub fn substitution_count(&self) -> usize {
        self.substitutions().count()
    }

    /// Number of positions covered by missing ranges
    pub fn missing_position_count(&self) -> usize {
        self.missing_ranges()
            .map(|(_, start, end)| (end.unwrap() - start.unwrap()) as usize + 1)
            .sum()
    }

    /// Whether the sample carries no information at the position
    pub fn is_missing(&self, position: SequencePosition) -> bool {
        // index of the first record starting after the position; the sentinel bounds the search
        let after = self.0.partition_point(|record| record.position() <= position);
        after
            .checked_sub(1)
            .map(|i| match self.0[i] {
                StagedMutation::Missing { end, .. } => position <= end,
                _ => false,
            })
            .unwrap_or(false)
    }
}
