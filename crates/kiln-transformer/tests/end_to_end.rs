use kiln_core::{KilnError, Tensor};
use kiln_data::{DataLoader, SequenceDataset};
use kiln_nn::{cross_entropy_language_model, load_inference_graph, load_module, score_fn, Module, Trainer, TrainingConfig};
use kiln_transformer::{
    generate, generate_tokens, BigramLanguageModel, DecoderStack, DecoderVariant, LanguageModel, ModelConfig,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

const VARIANTS: [DecoderVariant; 3] = [DecoderVariant::Simple, DecoderVariant::Gpt1, DecoderVariant::Gpt2];

fn scenario_config() -> ModelConfig {
    ModelConfig::new(10, 8, 4, 2, 1)
}

fn corpus() -> Vec<usize> {
    (0..120).map(|i| (i * 3 + i / 7) % 10).collect()
}

fn loader(tokens: &[usize], context: usize, seed: u64) -> DataLoader {
    let dataset = SequenceDataset::from_tokens(tokens, context).unwrap();
    DataLoader::new(Box::new(dataset), 8, true, false, Some(seed)).unwrap()
}

#[test]
fn scenario_forward_and_sample() {
    let mut rng = StdRng::seed_from_u64(42);
    for variant in VARIANTS {
        let mut model = DecoderStack::new(&scenario_config(), variant).unwrap();
        let idx = Tensor::from_ids(&[1, 2, 3], &[1, 3]).unwrap();
        assert_eq!(model.forward(&idx).unwrap().dims(), &[1, 3, 10]);

        let out = generate(&mut model, &idx, 2, None, &mut rng).unwrap();
        assert_eq!(out.dims(), &[1, 5]);
        let ids = out.to_ids(10).unwrap();
        assert_eq!(&ids[..3], &[1, 2, 3], "{variant:?}");
    }
}

#[test]
fn sampling_past_context_window_crops() {
    let mut model = DecoderStack::gpt2(&scenario_config()).unwrap();
    let out = generate_tokens(&mut model, &[1, 2, 3], 9, None, &mut StdRng::seed_from_u64(7)).unwrap();
    assert_eq!(out.len(), 12);
    assert!(out.iter().all(|&id| id < model.vocab_size()));
}

#[test]
fn gpt2_trains_with_validation() {
    let tokens = corpus();
    let (train_tokens, val_tokens) = tokens.split_at(90);
    let config = scenario_config().with_dropout(0.1).with_bias(false);
    let model = DecoderStack::gpt2(&config).unwrap();

    let training = TrainingConfig::new().with_lr(0.05).with_epochs(3);
    let mut trainer = Trainer::new(model, cross_entropy_language_model, training).unwrap();
    let results = trainer.fit(&loader(train_tokens, 4, 1), Some(&loader(val_tokens, 4, 2))).unwrap();

    for key in ["training_loss", "validation_loss", "training_accuracy", "validation_accuracy", "epoch_time"] {
        let values = results.get(key).unwrap();
        assert_eq!(values.len(), 3, "{key}");
        assert!(values.iter().all(|v| v.is_finite()), "{key}");
    }

    // the sampler can follow training and the next fit resets the mode
    let mut model = trainer.into_model();
    generate_tokens(&mut model, &[0], 3, None, &mut StdRng::seed_from_u64(3)).unwrap();
    assert!(!model.is_training());
    let mut trainer = Trainer::new(model, cross_entropy_language_model, TrainingConfig::new().with_epochs(1)).unwrap();
    trainer.fit(&loader(train_tokens, 4, 4), None).unwrap();
    assert!(trainer.model().is_training());
}

#[test]
fn training_without_validation_has_no_validation_keys() {
    let model = DecoderStack::gpt1(&scenario_config()).unwrap();
    let mut trainer = Trainer::new(model, cross_entropy_language_model, TrainingConfig::new()).unwrap();
    let results = trainer.fit(&loader(&corpus(), 4, 5), None).unwrap();
    assert!(results.contains("training_loss"));
    assert!(!results.contains("validation_loss"));
    assert!(!results.columns().any(|c| c.starts_with("validation_")));
}

#[test]
fn failing_score_does_not_stop_training() {
    let config = TrainingConfig::new()
        .with_epochs(2)
        .with_score_fn("explodes", score_fn(|_, _| Err(KilnError::InvalidConfig("score failure".into()))));
    let mut trainer = Trainer::new(BigramLanguageModel::new(10), cross_entropy_language_model, config).unwrap();
    let tokens = corpus();
    let results = trainer.fit(&loader(&tokens, 4, 6), Some(&loader(&tokens, 4, 7))).unwrap();

    assert!(results.get("training_explodes").unwrap().iter().all(|v| v.is_nan()));
    assert!(results.get("validation_explodes").unwrap().iter().all(|v| v.is_nan()));
    assert_eq!(results.get("training_accuracy").unwrap().len(), 2);
}

#[test]
fn saved_model_reloads_and_exports_graph() {
    let dir = tempfile::tempdir().unwrap();
    let config = scenario_config();
    let training = TrainingConfig::new().with_epochs(1).with_save(dir.path(), "simple_gpt");
    let mut trainer = Trainer::new(DecoderStack::simple(&config).unwrap(), cross_entropy_language_model, training).unwrap();
    trainer.fit(&loader(&corpus(), 4, 8), None).unwrap();

    let graph = load_inference_graph(&dir.path().join("simple_gpt.graph.json")).unwrap();
    assert_eq!(graph.input_shape[1], 4);
    assert_eq!(graph.output_shape[1..], [4, 10]);
    assert_eq!(graph.num_parameters, trainer.model().num_parameters());

    let mut restored = DecoderStack::simple(&config).unwrap();
    load_module(&mut restored, &dir.path().join("simple_gpt.safetensors")).unwrap();
    let idx = Tensor::from_ids(&[3, 1, 4], &[1, 3]).unwrap();
    let mut original = trainer.into_model();
    original.train(false);
    restored.train(false);
    let (a, b) = (original.forward(&idx).unwrap(), restored.forward(&idx).unwrap());
    for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
        assert!((x - y).abs() < 1e-6);
    }
}

#[test]
fn config_json_builds_same_architecture() {
    let config = scenario_config().with_bias(false);
    let parsed = ModelConfig::from_json(&config.to_json().unwrap()).unwrap();
    let a = DecoderStack::gpt2(&config).unwrap();
    let b = DecoderStack::gpt2(&parsed).unwrap();
    let names = |m: &DecoderStack| m.named_parameters().into_iter().map(|(n, t)| (n, t.dims().to_vec())).collect::<Vec<_>>();
    assert_eq!(names(&a), names(&b));
}
