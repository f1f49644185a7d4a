// Verification tests — reference comparison, quantized tolerances,
// dynamic-shape runs, serialized re-execution

use vole::prelude::*;
use vole::{Graph, OpKind};

use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn test_export_compared_against_itself_at_zero_tolerance() {
    let mut rng = StdRng::seed_from_u64(41);
    let model = Linear {
        weight: Tensor::randn([4, 3], &mut rng),
        bias: Some(Tensor::randn([3], &mut rng)),
    };
    let x = Tensor::randn([2, 4], &mut rng);
    let mut tester = Tester::new(model, vec![x.clone()]);
    tester
        .export()
        .unwrap()
        .run_method_and_compare_outputs(
            CompareOptions::default()
                .with_inputs(vec![x])
                .with_tolerances(0.0, 0.0, 0.0),
        )
        .unwrap();
}

#[test]
fn test_identity_chain_with_fixed_input_passes_exactly() {
    // Export -> ToIntermediate -> Partition -> Finalize -> Serialize on an
    // identity-like model: zero divergence at default tolerances.
    let x = Tensor::randn([1, 3, 4, 4], &mut StdRng::seed_from_u64(43));
    let mut tester = Tester::new(Scale::identity(), vec![x.clone()]);
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
        .unwrap()
        .run_method_and_compare_outputs(
            CompareOptions::default()
                .with_inputs(vec![x])
                .with_tolerances(0.0, 0.0, 0.0),
        )
        .unwrap();
}

#[test]
fn test_quantized_candidate_needs_qtol() {
    // A transform shifts the final artifact by exactly one quantization
    // step: qtol=1 absorbs it, qtol=0 rejects it.
    fn shift_by_output_scale(graph: &Graph) -> vole::Result<Graph> {
        let out_id = graph.outputs()[0];
        let out = graph.node(out_id);
        let scale = match out.op {
            OpKind::DequantizePerTensor { scale, .. } => scale,
            _ => return Err(Error::msg("expected a dequantized output")),
        };
        let mut shifted = graph.clone();
        let offset = shifted.add_constant(Tensor::from_f32(
            vec![scale; out.shape.elem_count()],
            out.shape.clone(),
        )?);
        let sum = shifted.add_node(OpKind::Add, vec![out_id, offset])?;
        shifted.set_outputs(vec![sum])?;
        Ok(shifted)
    }

    let x = Tensor::from_f32(vec![0.5, -0.25, 1.0, -1.0], [4]).unwrap();

    let run = |qtol: f32| -> vole::Result<()> {
        let mut tester = Tester::new(Scale { factor: 2.0 }, vec![x.clone()]);
        tester
            .quantize()?
            .export()?
            .run_passes_with(
                RunPasses::new().with_transforms(vec![Box::new(shift_by_output_scale)]),
            )?
            .run_method_and_compare_outputs(
                CompareOptions::default()
                    .with_inputs(vec![x.clone()])
                    .with_tolerances(1e-6, 0.0, qtol),
            )?;
        Ok(())
    };

    assert!(matches!(
        run(0.0),
        Err(Error::ComparisonMismatch { .. })
    ));
    run(1.0).unwrap();
}

#[test]
fn test_quantized_pipeline_passes_with_one_step_tolerance() {
    let mut rng = StdRng::seed_from_u64(47);
    let model = Conv2d {
        weight: Tensor::randn([2, 3, 3, 3], &mut rng),
        bias: Some(Tensor::randn([2], &mut rng)),
        stride: 1,
        padding: 0,
    };
    let x = Tensor::randn([1, 3, 4, 4], &mut rng);
    let mut tester = Tester::new(model, vec![x.clone()]);
    tester
        .quantize()
        .unwrap()
        .export()
        .unwrap()
        .check(&["quantize_per_tensor", "dequantize_per_tensor"])
        .unwrap()
        .to_intermediate_transform_and_lower()
        .unwrap()
        .finalize()
        .unwrap()
        .serialize()
        .unwrap()
        .run_method_and_compare_outputs(
            CompareOptions::default()
                .with_inputs(vec![x])
                .with_tolerances(1e-3, 1e-3, 1.0),
        )
        .unwrap();
}

#[test]
fn test_dynamic_shapes_verified_over_random_runs() {
    fn double(x: usize) -> usize {
        2 * x
    }

    let mut rng = StdRng::seed_from_u64(53);
    // Batch is symbolic, the feature dim fixed; a second input shares the
    // symbolic name through a derived dimension.
    struct PairSum;
    impl Module for PairSum {
        fn forward(
            &self,
            tracer: &mut vole::Tracer,
            inputs: &[vole::NodeId],
        ) -> vole::Result<Vec<vole::NodeId>> {
            let lhs = tracer.relu(inputs[0])?;
            Ok(vec![lhs, tracer.exp(inputs[1])?])
        }
    }

    let example = vec![
        Tensor::randn([4, 3], &mut rng),
        Tensor::randn([8, 3], &mut rng),
    ];
    let specs = vec![
        DynamicShapeSpec::new().with_dim(0, DynDim::new("batch", 2, 16)),
        DynamicShapeSpec::new().with_dim(0, DynDim::derived("batch", 2, 16, double)),
    ];

    let mut tester = Tester::new(PairSum, example).with_dynamic_shapes(specs);
    tester
        .export()
        .unwrap()
        .run_method_and_compare_outputs(CompareOptions::default().with_num_runs(3))
        .unwrap();
}

#[test]
fn test_compare_requires_export_reference() {
    let x = Tensor::from_f32(vec![1.0], [1]).unwrap();
    let mut tester = Tester::new(Scale::identity(), vec![x]);
    tester.quantize().unwrap();
    assert!(matches!(
        tester.run_method_and_compare_outputs(CompareOptions::default()),
        Err(Error::NotYetRun { .. })
    ));
}

#[test]
fn test_compare_specific_earlier_stage() {
    let x = Tensor::randn([1, 3, 4, 4], &mut StdRng::seed_from_u64(59));
    let mut tester = Tester::new(Scale::identity(), vec![x.clone()]);
    tester
        .export()
        .unwrap()
        .to_intermediate()
        .unwrap()
        .partition()
        .unwrap()
        .finalize()
        .unwrap();

    // Verify the pre-partition program rather than the current stage.
    tester
        .run_method_and_compare_outputs(
            CompareOptions::default()
                .with_stage(StageKind::ToIntermediate)
                .with_inputs(vec![x]),
        )
        .unwrap();
}
