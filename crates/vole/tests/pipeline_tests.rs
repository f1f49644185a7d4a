// Pipeline tests — stage ordering, duplicate handling, checks, dumping

use vole::prelude::*;

use rand::rngs::StdRng;
use rand::SeedableRng;

fn conv_model(rng: &mut StdRng) -> Sequential {
    Sequential(vec![
        Box::new(Conv2d {
            weight: Tensor::randn([4, 3, 3, 3], rng),
            bias: Some(Tensor::randn([4], rng)),
            stride: 1,
            padding: 1,
        }),
        Box::new(Relu),
        Box::new(Conv2d {
            weight: Tensor::randn([2, 4, 3, 3], rng),
            bias: None,
            stride: 1,
            padding: 0,
        }),
    ])
}

fn example_nchw(rng: &mut StdRng) -> Vec<Tensor> {
    vec![Tensor::randn([1, 3, 4, 4], rng)]
}

#[test]
fn test_full_quantized_chain_and_illegal_partition() {
    let mut rng = StdRng::seed_from_u64(11);
    let inputs = example_nchw(&mut rng);
    let mut tester = Tester::new(conv_model(&mut rng), inputs);

    tester
        .quantize()
        .unwrap()
        .export()
        .unwrap()
        .to_intermediate_transform_and_lower()
        .unwrap()
        .finalize()
        .unwrap();

    // Partition is not a legal successor of Finalize; the failure names
    // both stages and leaves the session usable.
    match tester.partition() {
        Err(Error::InvalidTransition { from, to }) => {
            assert_eq!(from, "Finalize");
            assert_eq!(to, "Partition");
        }
        other => panic!("expected InvalidTransition, got {other:?}"),
    }

    // The failed attempt did not move the pipeline; Serialize still works.
    tester.serialize().unwrap();
    assert!(matches!(
        tester.get_artifact(None).unwrap(),
        Artifact::Bytes(_)
    ));
}

#[test]
fn test_duplicate_stage_keeps_first_artifact() {
    let mut rng = StdRng::seed_from_u64(5);
    let inputs = example_nchw(&mut rng);
    let mut tester = Tester::new(conv_model(&mut rng), inputs);
    tester.export().unwrap();

    match tester.export() {
        Err(Error::DuplicateStage { stage }) => assert_eq!(stage, "Export"),
        other => panic!("expected DuplicateStage, got {other:?}"),
    }

    // First invocation's artifact is still retrievable.
    let artifact = tester.get_artifact(Some(StageKind::Export)).unwrap();
    assert!(matches!(artifact, Artifact::Graph(_)));
}

#[test]
fn test_pipeline_must_start_at_an_entry_stage() {
    let mut rng = StdRng::seed_from_u64(2);
    let inputs = example_nchw(&mut rng);
    let mut tester = Tester::new(conv_model(&mut rng), inputs);
    assert!(matches!(
        tester.partition(),
        Err(Error::InvalidTransition { .. })
    ));
    // Session untouched; an entry stage still starts the pipeline.
    tester.export().unwrap();
}

#[test]
fn test_quantize_only_precedes_export() {
    let mut rng = StdRng::seed_from_u64(3);
    let inputs = example_nchw(&mut rng);
    let mut tester = Tester::new(conv_model(&mut rng), inputs);
    tester.quantize().unwrap();
    match tester.to_intermediate() {
        Err(Error::InvalidTransition { from, to }) => {
            assert_eq!(from, "Quantize");
            assert_eq!(to, "ToIntermediate");
        }
        other => panic!("expected InvalidTransition, got {other:?}"),
    }
    tester.export().unwrap();
}

#[test]
fn test_check_node_count_exact_and_diagnostic() {
    let mut rng = StdRng::seed_from_u64(17);
    let inputs = example_nchw(&mut rng);
    let mut tester = Tester::new(conv_model(&mut rng), inputs);
    tester.export().unwrap();

    tester.check_node_count(&[("conv2d", 2), ("relu", 1)]).unwrap();

    match tester.check_node_count(&[("conv2d", 3)]) {
        Err(Error::NodeCountMismatch {
            op,
            expected,
            found,
            counts,
        }) => {
            assert_eq!(op, "conv2d");
            assert_eq!(expected, 3);
            assert_eq!(found, 2);
            assert!(counts.contains("conv2d"));
        }
        other => panic!("expected NodeCountMismatch, got {other:?}"),
    }
}

#[test]
fn test_pattern_checks_over_debug_view() {
    let mut rng = StdRng::seed_from_u64(23);
    let inputs = example_nchw(&mut rng);
    let mut tester = Tester::new(conv_model(&mut rng), inputs);
    tester.export().unwrap();

    tester
        .check(&["conv2d[stride=1, padding=1]", "relu"])
        .unwrap()
        .check_not(&["delegate", "quantize_per_tensor"])
        .unwrap()
        .check_count(&[("conv2d", 2)])
        .unwrap();

    assert!(matches!(
        tester.check(&["softmax"]),
        Err(Error::CheckFailed(_))
    ));
    assert!(matches!(
        tester.check_not(&["relu"]),
        Err(Error::CheckFailed(_))
    ));
}

#[test]
fn test_delegation_replaces_ops_after_partition() {
    let mut rng = StdRng::seed_from_u64(29);
    let inputs = example_nchw(&mut rng);
    let mut tester = Tester::new(conv_model(&mut rng), inputs);
    tester
        .export()
        .unwrap()
        .to_intermediate()
        .unwrap()
        .partition()
        .unwrap()
        .check(&["delegate[backend=cpu-ref]"])
        .unwrap()
        .check_node_count(&[("delegate", 1), ("conv2d", 0)])
        .unwrap();
}

#[test]
fn test_run_passes_applies_in_order() {
    // The dead exp branch survives export and disappears under the pass.
    struct WithDeadBranch;
    impl Module for WithDeadBranch {
        fn forward(
            &self,
            tracer: &mut vole::Tracer,
            inputs: &[vole::NodeId],
        ) -> vole::Result<Vec<vole::NodeId>> {
            let live = tracer.relu(inputs[0])?;
            let _dead = tracer.exp(inputs[0])?;
            Ok(vec![live])
        }
    }

    let x = Tensor::from_f32(vec![1.0, -2.0], [2]).unwrap();
    let mut tester = Tester::new(WithDeadBranch, vec![x]);
    tester
        .export()
        .unwrap()
        .check_node_count(&[("exp", 1)])
        .unwrap()
        .run_passes_with(
            RunPasses::new()
                .with_passes(vec![Box::new(EliminateDeadNodes), Box::new(FoldConstants)]),
        )
        .unwrap()
        .check_node_count(&[("exp", 0), ("relu", 1)])
        .unwrap();
}

#[test]
fn test_dump_artifact_appends_banner_and_graph() {
    let mut rng = StdRng::seed_from_u64(31);
    let inputs = example_nchw(&mut rng);
    let mut tester = Tester::new(conv_model(&mut rng), inputs);
    tester.export().unwrap().to_intermediate().unwrap();

    let path = std::env::temp_dir().join(format!("vole_dump_{}.txt", std::process::id()));
    let _ = std::fs::remove_file(&path);

    tester
        .dump_artifact(Some(&path), Some(StageKind::Export))
        .unwrap()
        .dump_artifact(Some(&path), None)
        .unwrap();

    let dumped = std::fs::read_to_string(&path).unwrap();
    let expected_banner = format!("{} Export {}", "#".repeat(36), "#".repeat(36));
    assert!(dumped.contains(&expected_banner));
    assert!(dumped.contains(" ToIntermediate "));
    assert!(dumped.contains("conv2d"));
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_finalize_dump_includes_memory_plan() {
    let mut rng = StdRng::seed_from_u64(37);
    let inputs = example_nchw(&mut rng);
    let mut tester = Tester::new(conv_model(&mut rng), inputs);
    tester
        .export()
        .unwrap()
        .to_intermediate()
        .unwrap()
        .partition()
        .unwrap()
        .finalize()
        .unwrap();

    let path = std::env::temp_dir().join(format!("vole_final_{}.txt", std::process::id()));
    let _ = std::fs::remove_file(&path);
    tester.dump_artifact(Some(&path), None).unwrap();
    let dumped = std::fs::read_to_string(&path).unwrap();
    assert!(dumped.contains("memory plan ("));
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_serialized_dump_requires_path() {
    let x = Tensor::from_f32(vec![1.0], [1]).unwrap();
    let mut tester = Tester::new(Scale::identity(), vec![x]);
    tester
        .export()
        .unwrap()
        .to_intermediate()
        .unwrap()
        .partition()
        .unwrap()
        .finalize()
        .unwrap()
        .serialize()
        .unwrap();

    assert!(tester.dump_artifact(None, None).is_err());

    let path = std::env::temp_dir().join(format!("vole_prog_{}.vole", std::process::id()));
    let _ = std::fs::remove_file(&path);
    tester.dump_artifact(Some(&path), None).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..4], b"VOLE");
    std::fs::remove_file(&path).unwrap();
}
