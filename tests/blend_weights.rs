use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gridiron_ensemble::calibration::Recalibration;
use gridiron_ensemble::stacking::{BlendWeights, apply_diversity_guard, clamp_weights};

#[test]
fn guarded_weights_stay_on_the_simplex() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..2000 {
        let raw = [(); 4].map(|_| {
            if rng.gen_bool(0.2) { 0.0 } else { rng.gen_range(-0.5..3.0) }
        });
        let variance = if rng.gen_bool(0.5) { rng.gen_range(0.0..0.02) } else { rng.gen_range(0.0..1.0) };
        let weeks = rng.gen_range(0..10);

        let clamped = clamp_weights(BlendWeights::from_array(raw), weeks);
        let guarded = apply_diversity_guard(clamped, variance);
        for w in [clamped, guarded] {
            assert!(w.as_array().iter().all(|v| *v >= 0.0), "{w:?}");
            assert!((w.sum() - 1.0).abs() < 1e-6, "{w:?}");
        }
    }
}

#[test]
fn collapsed_weights_fall_back_to_uniform() {
    let zero = BlendWeights::from_array([0.0; 4]);
    assert_eq!(clamp_weights(zero, 1), BlendWeights::uniform());
    assert_eq!(apply_diversity_guard(zero, 0.0), BlendWeights::uniform());
}

#[test]
fn recalibration_is_non_decreasing_for_non_negative_beta() {
    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..200 {
        let cal = Recalibration::new(rng.gen_range(-2.0..6.0), rng.gen_range(-3.0..3.0));
        assert!(cal.beta >= 0.0);
        let mut last = 0.0;
        for i in 0..=100 {
            let p = cal.apply(i as f64 / 100.0);
            assert!(p >= last, "{cal:?} at {i}");
            last = p;
        }
    }
}
