use std::collections::BTreeMap;

use libmat::dna::{Nucleotide, ReferenceSequence, NUC_A, NUC_C, NUC_G, NUC_T};
use libmat::mutations::RawMutation;
use libmat::{NodeId, SampleInput, Tree};
use rand::rngs::StdRng;
use rand::Rng;

pub const BASES: [Nucleotide; 4] = [NUC_A, NUC_C, NUC_G, NUC_T];

/// A reference of `len` bases cycling through `ACGT`
#[allow(dead_code)]
pub fn cycled_reference(len: usize) -> ReferenceSequence {
    ReferenceSequence::from_bases((0..len).map(|i| BASES[i % 4]).collect())
}

#[allow(dead_code)]
pub fn substitution(tree: &Tree, position: u32, mutant: Nucleotide) -> RawMutation {
    RawMutation::Substitution {
        chromosome: 0,
        position: position.into(),
        parent: tree.reference().get(position.into()).unwrap(),
        mutant,
    }
}

#[allow(dead_code)]
pub fn missing(start: u32, end: u32) -> RawMutation {
    RawMutation::Missing {
        chromosome: 0,
        start: start.into(),
        end: end.into(),
    }
}

#[allow(dead_code)]
pub fn sample(tree: &Tree, name: &str, alleles: &[(u32, Nucleotide)]) -> SampleInput {
    SampleInput::new(
        name,
        alleles
            .iter()
            .map(|&(position, mutant)| substitution(tree, position, mutant))
            .collect(),
    )
}

/// `root -> A(100T) -> { A1, A2(200G) }` over an all-`A` reference
#[allow(dead_code)]
pub fn scenario_tree() -> Tree {
    let mut tree = Tree::new("root", ReferenceSequence::parse(&"A".repeat(500)).unwrap());
    let a = tree.add_child_with_alleles(tree.root(), "A", &[(100, NUC_T)]).unwrap();
    tree.add_child_with_alleles(a, "A1", &[]).unwrap();
    tree.add_child_with_alleles(a, "A2", &[(200, NUC_G)]).unwrap();
    tree.recompute_descendant_alleles();
    tree
}

fn other_base(rng: &mut StdRng, current: Nucleotide) -> Nucleotide {
    let choices: Vec<Nucleotide> = BASES.iter().copied().filter(|&b| b != current).collect();
    choices[rng.gen_range(0..choices.len())]
}

/// A random tree of `nodes` nodes below the root, each branch carrying up to three substitutions
#[allow(dead_code)]
pub fn random_tree(rng: &mut StdRng, reference_len: usize, nodes: usize) -> Tree {
    let mut tree = Tree::new("root", cycled_reference(reference_len));
    let mut ids: Vec<NodeId> = vec![tree.root()];

    for i in 0..nodes {
        let parent = ids[rng.gen_range(0..ids.len())];
        let mut positions: Vec<u32> = (0..rng.gen_range(0..4))
            .map(|_| rng.gen_range(1..=reference_len as u32))
            .collect();
        positions.sort_unstable();
        positions.dedup();

        let alleles: Vec<(u32, Nucleotide)> = positions
            .into_iter()
            .map(|p| (p, other_base(rng, tree.allele_at(parent, p.into()))))
            .collect();
        let id = tree
            .add_child_with_alleles(parent, format!("n{i}"), &alleles)
            .unwrap();
        ids.push(id);
    }

    tree.recompute_descendant_alleles();
    tree
}

fn start(record: &RawMutation) -> u32 {
    match record {
        RawMutation::Substitution { position, .. } => position.unwrap(),
        RawMutation::Missing { start, .. } => start.unwrap(),
    }
}

/// A sample close to the state of a random node: a few alleles dropped or added, and sometimes a
/// short missing range.
#[allow(dead_code)]
pub fn random_sample(rng: &mut StdRng, tree: &Tree, name: &str) -> SampleInput {
    let nodes: Vec<NodeId> = tree.preorder(tree.root()).collect();
    let node = nodes[rng.gen_range(0..nodes.len())];
    let len = tree.reference().len() as u32;

    let mut alleles: BTreeMap<u32, Nucleotide> = tree
        .path_alleles(node, true)
        .into_iter()
        .map(|(position, allele)| (position.unwrap(), allele))
        .collect();
    for _ in 0..rng.gen_range(0..3) {
        let position = rng.gen_range(1..=len);
        let reference = tree.reference().get(position.into()).unwrap();
        alleles.insert(position, other_base(rng, reference));
    }
    alleles.retain(|_, _| rng.gen_bool(0.9));

    let mut records = Vec::new();
    if rng.gen_bool(0.3) {
        let from = rng.gen_range(1..=len - 5);
        let to = from + rng.gen_range(0..5);
        alleles.retain(|&position, _| position < from || position > to);
        records.push(missing(from, to));
    }
    records.extend(
        alleles
            .into_iter()
            .map(|(position, mutant)| substitution(tree, position, mutant)),
    );
    records.sort_by_key(start);

    SampleInput::new(name, records)
}

/// Number of substitutions in a sample, i.e. its cost as a direct child of an unmutated root
#[allow(dead_code)]
pub fn substitution_count(sample: &SampleInput) -> u32 {
    sample
        .mutations
        .iter()
        .filter(|record| matches!(record, RawMutation::Substitution { .. }))
        .count() as u32
}
