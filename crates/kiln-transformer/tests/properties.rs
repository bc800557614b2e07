use kiln_core::Tensor;
use kiln_nn::{LayerNorm, Module};
use kiln_transformer::{
    generate_tokens, AttentionHead, BigramLanguageModel, DecoderStack, DecoderVariant, ModelConfig, MultiHeadAttention,
};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn variant() -> impl Strategy<Value = DecoderVariant> {
    prop_oneof![Just(DecoderVariant::Simple), Just(DecoderVariant::Gpt1), Just(DecoderVariant::Gpt2)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn attention_is_causal_and_normalized(context in 1usize..8, len_frac in 0.0f64..=1.0, batch in 1usize..3) {
        let len = ((context as f64 * len_frac).ceil() as usize).clamp(1, context);
        let head = AttentionHead::new(6, 3, context, 0.0).unwrap();
        let weights = head.attention_weights(&Tensor::randn(&[batch, len, 6], 1.0)).unwrap();
        prop_assert_eq!(weights.dims(), &[batch, len, len]);
        for (r, row) in weights.as_slice().chunks(len).enumerate() {
            let i = r % len;
            prop_assert!(row[i + 1..].iter().all(|&w| w == 0.0));
            prop_assert!(row.iter().all(|&w| w >= 0.0));
            prop_assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn multi_head_width_matches_embedding(heads in 1usize..5, head_size in 1usize..4, len in 1usize..5) {
        let dim = heads * head_size;
        let mha = MultiHeadAttention::new(dim, heads, 4, 0.0).unwrap();
        let out = mha.forward(&Tensor::randn(&[2, len.min(4), dim], 1.0)).unwrap();
        prop_assert_eq!(out.dims(), &[2, len.min(4), dim]);
        prop_assert!(MultiHeadAttention::new(dim, dim + 1, 4, 0.0).is_err());
    }

    #[test]
    fn decoder_preserves_shape(variant in variant(), batch in 1usize..3, len in 1usize..5) {
        let model = DecoderStack::new(&ModelConfig::new(9, 8, 4, 2, 1), variant).unwrap();
        let ids: Vec<usize> = (0..batch * len).map(|i| i % 9).collect();
        let logits = model.forward(&Tensor::from_ids(&ids, &[batch, len]).unwrap()).unwrap();
        prop_assert_eq!(logits.dims(), &[batch, len, 9]);
    }

    #[test]
    fn sampler_appends_exactly_n(prompt in prop::collection::vec(0usize..6, 1..4), n in 0usize..12, seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut bigram = BigramLanguageModel::new(6);
        let out = generate_tokens(&mut bigram, &prompt, n, None, &mut rng).unwrap();
        prop_assert_eq!(out.len(), prompt.len() + n);
        prop_assert_eq!(&out[..prompt.len()], &prompt[..]);
        prop_assert!(out.iter().all(|&id| id < 6));

        let mut decoder = DecoderStack::gpt2(&ModelConfig::new(6, 4, 3, 1, 1)).unwrap();
        let out = generate_tokens(&mut decoder, &prompt, n, None, &mut rng).unwrap();
        prop_assert_eq!(out.len(), prompt.len() + n);
        prop_assert!(out.iter().all(|&id| id < 6));
    }

    #[test]
    fn bias_free_norm_matches_zero_bias(rows in 1usize..4, dim in 2usize..9) {
        let x = Tensor::randn(&[rows, dim], 2.0);
        let with_bias = LayerNorm::new(dim, true);
        let without = LayerNorm::new(dim, false);
        prop_assert!(with_bias.bias().is_some_and(|b| b.as_slice().iter().all(|&v| v == 0.0)));
        let (biased, bias_free) = (with_bias.forward(&x).unwrap(), without.forward(&x).unwrap());
        prop_assert_eq!(biased.as_slice(), bias_free.as_slice());
    }
}
