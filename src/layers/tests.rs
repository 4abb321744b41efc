use super::*;
use crate::store::MemoryStore;

// =========================================================================
// softmax
// =========================================================================

#[test]
fn test_softmax_sums_to_one() {
    let probs = softmax(&[0.5, -1.0, 2.0, 0.0]).expect("softmax");
    let total: f32 = probs.iter().sum();
    assert!((total - 1.0).abs() < 1e-6);
    assert!(probs.iter().all(|&p| p >= 0.0));
}

#[test]
fn test_softmax_uniform() {
    let probs = softmax(&[3.0, 3.0, 3.0, 3.0]).expect("softmax");
    for p in probs {
        assert!((p - 0.25).abs() < 1e-6);
    }
}

#[test]
fn test_softmax_preserves_order() {
    let probs = softmax(&[1.0, 3.0, 2.0]).expect("softmax");
    assert!(probs[1] > probs[2] && probs[2] > probs[0]);
}

#[test]
fn test_softmax_large_scores_without_overflow() {
    let probs = softmax(&[100.0, 0.0]).expect("softmax");
    assert!((probs[0] - 1.0).abs() < 1e-6);
}

#[test]
fn test_softmax_empty_error() {
    assert!(softmax(&[]).is_err());
}

#[test]
fn test_softmax_overflow_not_trapped() {
    // no max-subtraction: exp(1000) overflows f64
    let probs = softmax(&[1000.0, 0.0]).expect("softmax");
    assert!(probs[0].is_nan());
    assert_eq!(probs[1], 0.0);
}

// =========================================================================
// gelu
// =========================================================================

#[test]
fn test_gelu_zero() {
    assert_eq!(gelu(0.0), 0.0);
}

#[test]
fn test_gelu_tails() {
    assert!((gelu(10.0) - 10.0).abs() < 1e-4);
    assert!(gelu(-10.0).abs() < 1e-4);
}

#[test]
fn test_gelu_known_value() {
    // 0.5 * (1 + tanh(0.79788456 * 1.044715))
    assert!((gelu(1.0) - 0.841_192).abs() < 1e-4);
}

// =========================================================================
// LayerNorm
// =========================================================================

#[test]
fn test_layer_norm_zero_mean_unit_variance() {
    let norm = LayerNorm::new(vec![1.0; 4], vec![0.0; 4], 1e-5).expect("norm");
    let out = norm.forward(&[1.0, 2.0, 3.0, 4.0]).expect("forward");

    let mean: f32 = out.iter().sum::<f32>() / 4.0;
    let var: f32 = out.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / 4.0;
    assert!(mean.abs() < 1e-5);
    assert!((var - 1.0).abs() < 1e-3);
}

#[test]
fn test_layer_norm_affine() {
    let norm = LayerNorm::new(vec![2.0, 2.0], vec![1.0, 1.0], 0.0).expect("norm");
    let out = norm.forward(&[0.0, 2.0]).expect("forward");
    // normalized [-1, 1] * 2 + 1
    assert!((out[0] + 1.0).abs() < 1e-6);
    assert!((out[1] - 3.0).abs() < 1e-6);
}

#[test]
fn test_layer_norm_constant_input_uses_epsilon() {
    let norm = LayerNorm::new(vec![1.0; 3], vec![0.5; 3], 1e-5).expect("norm");
    let out = norm.forward(&[7.0, 7.0, 7.0]).expect("forward");
    assert!(out.iter().all(|&v| (v - 0.5).abs() < 1e-6));
}

#[test]
fn test_layer_norm_shape_errors() {
    assert!(LayerNorm::new(vec![], vec![], 1e-5).is_err());
    assert!(LayerNorm::new(vec![1.0; 2], vec![0.0; 3], 1e-5).is_err());

    let norm = LayerNorm::new(vec![1.0; 2], vec![0.0; 2], 1e-5).expect("norm");
    assert!(norm.forward(&[1.0, 2.0, 3.0]).is_err());
    assert_eq!(norm.normalized_shape(), 2);
}

// =========================================================================
// Linear / FeedForward
// =========================================================================

#[test]
fn test_linear_bias_length_checked() {
    let w = Matrix::zeros(2, 3).expect("matrix");
    assert!(Linear::new(w.clone(), Some(vec![0.0; 2])).is_err());
    let linear = Linear::new(w, Some(vec![1.0; 3])).expect("linear");
    assert!(linear.has_bias());
    assert_eq!(linear.forward(&[5.0, 5.0]).expect("forward"), vec![1.0; 3]);
}

#[test]
fn test_linear_load_skips_absent_bias() {
    let mut store = MemoryStore::new();
    store.insert("w", vec![1.0, 0.0, 0.0, 1.0]);

    let linear = Linear::load(&store, "w", "b", 2, 2, false).expect("linear");
    assert!(!linear.has_bias());
    assert!(Linear::load(&store, "w", "b", 2, 2, true).is_err());
}

#[test]
fn test_feed_forward_applies_gelu() {
    let ff = FeedForward::new(
        Linear::new(Matrix::identity(2, 8).expect("m"), None).expect("l1"),
        Linear::new(Matrix::identity(8, 2).expect("m"), None).expect("l2"),
    )
    .expect("ff");
    assert_eq!(ff.intermediate_size(), 8);

    let out = ff.forward(&[1.0, -1.0]).expect("forward");
    assert!((out[0] - gelu(1.0)).abs() < 1e-6);
    assert!((out[1] - gelu(-1.0)).abs() < 1e-6);
}

#[test]
fn test_feed_forward_chain_checked() {
    let result = FeedForward::new(
        Linear::new(Matrix::zeros(2, 8).expect("m"), None).expect("l1"),
        Linear::new(Matrix::zeros(4, 2).expect("m"), None).expect("l2"),
    );
    assert!(result.is_err());
}
