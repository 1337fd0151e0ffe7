//! Saving and loading trees that have been extended by placements.

mod common;

use common::{random_sample, random_tree, sample, scenario_tree};
use libmat::dna::{NUC_C, NUC_G, NUC_T};
use libmat::place::SpliceKind;
use libmat::{io, PlacementConfig, PlacementError, Placer};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn loaded_tree_matches_saved_tree() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut tree = random_tree(&mut rng, 100, 30);
    let samples: Vec<_> = (0..10)
        .map(|i| random_sample(&mut rng, &tree, &format!("s{i}")))
        .collect();
    let mut placer = Placer::new(PlacementConfig::default()).unwrap();
    assert!(placer.place_batch(&mut tree, samples).is_complete());

    let path = std::env::temp_dir().join(format!("libmat-snapshot-{}.json", std::process::id()));
    io::save(&tree, &path).unwrap();
    let loaded = io::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(io::to_json(&loaded).unwrap(), io::to_json(&tree).unwrap());
    assert_eq!(loaded.len(), tree.len());
    for id in loaded.preorder(loaded.root()) {
        let original = tree.get_node(loaded[id].identifier()).unwrap();
        assert_eq!(loaded[id].level(), tree[original].level());
        assert_eq!(loaded[id].branch_length(), tree[original].branch_length());
    }
}

#[test]
fn placement_continues_after_reload() {
    let mut tree = scenario_tree();
    let mut placer = Placer::new(PlacementConfig::default()).unwrap();
    let input = sample(&tree, "s1", &[(100, NUC_T), (300, NUC_C)]);
    let first = placer.place_sample(&mut tree, input).unwrap();
    let input = sample(&tree, "s2", &[(100, NUC_T), (300, NUC_C)]);
    let split = placer.place_sample(&mut tree, input).unwrap();
    assert_ne!(first.parent, split.parent);

    let generated = tree[split.parent].identifier().to_string();
    let mut loaded = io::from_json(&io::to_json(&tree).unwrap()).unwrap();
    assert!(loaded.get_node(&generated).is_some());

    // splitting A2 needs a fresh identifier that must not collide with the loaded one
    let input = sample(&loaded, "s3", &[(100, NUC_T), (200, NUC_G), (400, NUC_C)]);
    let report = placer.place_sample(&mut loaded, input).unwrap();
    assert_eq!(report.parsimony, 1);
    assert_eq!(report.kind, SpliceKind::Split);
    assert_eq!(loaded[report.parent].identifier(), "node_2");
    assert!(loaded.get_node(&generated).is_some());
}

#[test]
fn corrupted_snapshot_is_a_serialization_error() {
    let json = io::to_json(&scenario_tree()).unwrap();
    let truncated = &json[..json.len() / 2];
    assert!(matches!(io::from_json(truncated), Err(PlacementError::Serialization(_))));

    let duplicated = json.replace("\"A1\"", "\"A2\"");
    assert!(matches!(io::from_json(&duplicated), Err(PlacementError::Serialization(_))));
}
