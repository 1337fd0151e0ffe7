use crate::dna::NUC_N;
use crate::mutations::{find_position, Mutation, SequencePosition, StagedMutation, StagedMutations};
use crate::tree::{NodeId, Tree};
use crate::XxHashMap;

/// Turn a staged sample into the mutation list of its new leaf.
///
/// Concrete records are copied. Every position of a missing range becomes a placeholder whose
/// mutant allele is [`NUC_N`]. The parent allele of a placeholder is the allele the new parent
/// state has at that position: it is looked up in `shared` first (the branch that will sit
/// directly above the leaf after a split), then along the path from `parent` to the root. Positions
/// that no branch mutates keep the reference allele.
pub(crate) fn discretize_mutations(
    tree: &Tree,
    staged: &StagedMutations,
    shared: &[Mutation],
    parent: Option<NodeId>,
) -> Vec<Mutation> {
    let reference = tree.reference();
    let mut mutations = Vec::with_capacity(staged.records().len());
    let mut unresolved: XxHashMap<SequencePosition, usize> = XxHashMap::default();

    for record in staged.as_slice() {
        match *record {
            StagedMutation::Substitution {
                chromosome,
                position,
                parent,
                mutant,
            } => mutations.push(Mutation::new(
                chromosome,
                position,
                reference.get_unchecked(position),
                parent,
                mutant,
            )),
            StagedMutation::Missing {
                chromosome,
                start,
                end,
            } => {
                for position in start.unwrap()..=end.unwrap() {
                    let position = SequencePosition::from(position);
                    unresolved.insert(position, mutations.len());
                    mutations.push(Mutation::new(
                        chromosome,
                        position,
                        reference.get_unchecked(position),
                        NUC_N,
                        NUC_N,
                    ));
                }
            }
            StagedMutation::Sentinel => break,
        }
    }

    resolve_parents(&mut unresolved, &mut mutations, shared);
    let mut node = parent;
    while let Some(id) = node {
        if unresolved.is_empty() {
            break;
        }
        resolve_parents(&mut unresolved, &mut mutations, tree[id].mutations());
        node = tree[id].parent();
    }

    for (position, index) in unresolved {
        mutations[index].set_parent(reference.get_unchecked(position));
    }

    mutations
}

/// Take the parent allele of unresolved placeholders from a branch's mutant alleles.
fn resolve_parents(
    unresolved: &mut XxHashMap<SequencePosition, usize>,
    mutations: &mut [Mutation],
    branch: &[Mutation],
) {
    if unresolved.len() < branch.len() {
        unresolved.retain(|&position, &mut index| match find_position(branch, position) {
            Some(found) => {
                mutations[index].set_parent(found.mutant());
                false
            }
            None => true,
        });
    } else {
        for mutation in branch {
            if let Some(index) = unresolved.remove(&mutation.position()) {
                mutations[index].set_parent(mutation.mutant());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dna::{ReferenceSequence, NUC_A, NUC_C, NUC_G, NUC_T};

    fn missing(start: u32, end: u32) -> StagedMutation {
        StagedMutation::Missing {
            chromosome: 0,
            start: start.into(),
            end: end.into(),
        }
    }

    #[test]
    fn placeholders_take_nearest_ancestral_allele() {
        let mut tree = Tree::new("root", ReferenceSequence::parse(&"A".repeat(20)).unwrap());
        let a = tree.add_child_with_alleles(tree.root(), "a", &[(3, NUC_G), (4, NUC_C)]).unwrap();
        let b = tree.add_child_with_alleles(a, "b", &[(3, NUC_T)]).unwrap();

        let staged = StagedMutations::from_sorted(vec![
            StagedMutation::Substitution {
                chromosome: 0,
                position: 1.into(),
                parent: NUC_A,
                mutant: NUC_C,
            },
            missing(3, 5),
        ]);
        let shared = vec![Mutation::new(0, 5.into(), NUC_A, NUC_A, NUC_G)];
        let mutations = discretize_mutations(&tree, &staged, &shared, Some(b));

        let parents: Vec<_> = mutations.iter().map(|m| (m.position().unwrap(), m.parent())).collect();
        assert_eq!(parents, [(1, NUC_A), (3, NUC_T), (4, NUC_C), (5, NUC_G)]);
        assert!(mutations[1..].iter().all(|m| m.mutant() == NUC_N));
        assert!(mutations[1..].iter().all(|m| m.descendant_alleles() == NUC_N));
        assert_eq!(mutations[0].descendant_alleles(), NUC_C);
    }

    #[test]
    fn unresolved_placeholders_fall_back_to_reference() {
        let tree = Tree::new("root", ReferenceSequence::parse("ACGTACGT").unwrap());
        let staged = StagedMutations::from_sorted(vec![missing(2, 4)]);
        let mutations = discretize_mutations(&tree, &staged, &[], Some(tree.root()));

        let parents: Vec<_> = mutations.iter().map(|m| m.parent()).collect();
        assert_eq!(parents, [NUC_C, NUC_G, NUC_T]);
        assert_eq!(crate::mutations::count_substitutions(&mutations), 0);
    }
}
