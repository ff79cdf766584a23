// Tests for the convolutional layer: forward convolution, weight and bias
// gradients, upstream errors and update ordering.
// Each accelerated result is compared against a plain sequential loop nest.

use approx::assert_relative_eq;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use rust_conv_layers::accel::{shared, CpuAccelerator};
use rust_conv_layers::config::ConvolutionalConfig;
use rust_conv_layers::layers::{ConvolutionalLayer, InputLayer, Layer};
use rust_conv_layers::utils::{Activation, SimpleRng, StatefulTimer};
use rust_conv_layers::Error;

// ============================================================================
// Sequential reference
// ============================================================================

#[derive(Clone, Copy)]
struct Dims {
    batch: usize,
    up_planes: usize,
    up_board: usize,
    planes: usize,
    fs: usize,
    pad: bool,
}

impl Dims {
    fn margin(&self) -> isize {
        if self.pad {
            (self.fs / 2) as isize
        } else {
            0
        }
    }

    fn board(&self) -> usize {
        if self.pad {
            self.up_board
        } else {
            self.up_board - self.fs + 1
        }
    }

    fn up_index(&self, n: usize, u: usize, r: usize, c: usize) -> usize {
        ((n * self.up_planes + u) * self.up_board + r) * self.up_board + c
    }

    fn out_index(&self, n: usize, o: usize, r: usize, c: usize) -> usize {
        let board = self.board();
        ((n * self.planes + o) * board + r) * board + c
    }

    fn w_index(&self, o: usize, u: usize, r: usize, c: usize) -> usize {
        ((o * self.up_planes + u) * self.fs + r) * self.fs + c
    }

    fn upstream(&self, upstream: &[f32], n: usize, u: usize, r: isize, c: isize) -> Option<f32> {
        let size = self.up_board as isize;
        if r < 0 || r >= size || c < 0 || c >= size {
            None
        } else {
            Some(upstream[self.up_index(n, u, r as usize, c as usize)])
        }
    }
}

fn reference_forward(
    d: Dims,
    activation: Activation,
    upstream: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
) -> Vec<f32> {
    let board = d.board();
    let mut out = vec![0.0f32; d.batch * d.planes * board * board];
    for n in 0..d.batch {
        for o in 0..d.planes {
            for r in 0..board {
                for c in 0..board {
                    let mut sum = 0.0f64;
                    for u in 0..d.up_planes {
                        for fr in 0..d.fs {
                            for fc in 0..d.fs {
                                let ir = r as isize + fr as isize - d.margin();
                                let ic = c as isize + fc as isize - d.margin();
                                if let Some(x) = d.upstream(upstream, n, u, ir, ic) {
                                    sum += (weights[d.w_index(o, u, fr, fc)] * x) as f64;
                                }
                            }
                        }
                    }
                    if let Some(bias) = bias {
                        sum += bias[o] as f64;
                    }
                    out[d.out_index(n, o, r, c)] = activation.calc(sum as f32);
                }
            }
        }
    }
    out
}

fn reference_weight_changes(
    d: Dims,
    activation: Activation,
    learning_rate: f32,
    upstream: &[f32],
    results: &[f32],
    errors: &[f32],
) -> Vec<f32> {
    let board = d.board();
    let multiplier = learning_rate as f64 / d.batch as f64 / ((board * board) as f64).sqrt();
    let mut changes = vec![0.0f32; d.planes * d.up_planes * d.fs * d.fs];
    for o in 0..d.planes {
        for u in 0..d.up_planes {
            for fr in 0..d.fs {
                for fc in 0..d.fs {
                    let mut sum = 0.0f64;
                    for n in 0..d.batch {
                        for r in 0..board {
                            for c in 0..board {
                                let ir = r as isize - d.margin() + fr as isize;
                                let ic = c as isize - d.margin() + fc as isize;
                                if let Some(x) = d.upstream(upstream, n, u, ir, ic) {
                                    let index = d.out_index(n, o, r, c);
                                    let derivative = activation.calc_derivative(results[index]);
                                    sum += (x * derivative * errors[index]) as f64;
                                }
                            }
                        }
                    }
                    changes[d.w_index(o, u, fr, fc)] = (-multiplier * sum) as f32;
                }
            }
        }
    }
    changes
}

// ============================================================================
// Fixtures
// ============================================================================

fn config_for(d: Dims, activation: Activation, biased: bool) -> ConvolutionalConfig {
    let mut config = ConvolutionalConfig::new()
        .num_filters(d.planes)
        .filter_size(d.fs)
        .activation(activation);
    if d.pad {
        config = config.pad_zeros();
    }
    if biased {
        config = config.biased();
    }
    config
}

fn random_vec(rng: &mut SimpleRng, len: usize) -> Vec<f32> {
    let mut data = vec![0.0; len];
    rng.fill_uniform(&mut data, -1.0, 1.0);
    data
}

fn build(
    d: Dims,
    activation: Activation,
    biased: bool,
    accelerator: CpuAccelerator,
    seed: u64,
) -> (InputLayer, ConvolutionalLayer) {
    let mut rng = SimpleRng::new(seed);
    let mut input = InputLayer::new(d.up_planes, d.up_board);
    input.set_batch_size(d.batch);
    let data = random_vec(&mut rng, input.results_size());
    input.set_input(&data).unwrap();

    let config = config_for(d, activation, biased);
    let mut layer = ConvolutionalLayer::new(1, &input, &config, shared(accelerator)).unwrap();
    layer.randomize_weights(&mut rng);
    layer.propagate(&input).unwrap();
    (input, layer)
}

fn squared_loss(results: &[f32], expected: &[f32]) -> f64 {
    results
        .iter()
        .zip(expected)
        .map(|(y, t)| 0.5 * ((y - t) as f64).powi(2))
        .sum()
}

const SMALL: Dims = Dims {
    batch: 2,
    up_planes: 2,
    up_board: 4,
    planes: 3,
    fs: 3,
    pad: true,
};

// ============================================================================
// Forward Tests
// ============================================================================

mod forward_tests {
    use super::*;

    #[test]
    fn test_identity_center_filter_reproduces_input() {
        let d = Dims {
            batch: 2,
            up_planes: 1,
            up_board: 5,
            planes: 1,
            fs: 3,
            pad: true,
        };
        let (input, mut layer) = build(d, Activation::Linear, false, CpuAccelerator::new(), 3);
        let mut weights = vec![0.0; 9];
        weights[4] = 1.0;
        layer.set_weights(&weights).unwrap();
        layer.propagate(&input).unwrap();

        assert_eq!(layer.results().len(), input.results().len());
        for (got, want) in layer.results().iter().zip(input.results()) {
            assert_relative_eq!(*got, *want, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_identity_center_filter_single_board() {
        let mut input = InputLayer::new(1, 3);
        input.set_batch_size(1);
        let data = [0.5, -1.0, 2.0, 3.0, -0.25, 0.0, 1.5, 4.0, -2.0];
        input.set_input(&data).unwrap();
        let config = ConvolutionalConfig::new().num_filters(1).filter_size(3).pad_zeros();
        let mut layer =
            ConvolutionalLayer::new(1, &input, &config, shared(CpuAccelerator::new())).unwrap();
        layer
            .set_weights(&[0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0])
            .unwrap();
        layer.propagate(&input).unwrap();
        assert_eq!(layer.results(), &data);
    }

    #[test]
    fn test_linear_in_weights() {
        let (input, mut layer) = build(SMALL, Activation::Linear, false, CpuAccelerator::new(), 4);
        let single = layer.results().to_vec();
        let doubled: Vec<f32> = layer.weights().iter().map(|w| 2.0 * w).collect();
        layer.set_weights(&doubled).unwrap();
        layer.propagate(&input).unwrap();
        for (got, want) in layer.results().iter().zip(&single) {
            assert_relative_eq!(*got, 2.0 * want, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_weight_index_is_bijection() {
        let (_, layer) = build(SMALL, Activation::Linear, false, CpuAccelerator::new(), 6);
        let mut seen = HashSet::new();
        for o in 0..SMALL.planes {
            for u in 0..SMALL.up_planes {
                for r in 0..SMALL.fs {
                    for c in 0..SMALL.fs {
                        let index = layer.weight_index(o, u, r, c);
                        assert!(index < layer.weights_size());
                        assert!(seen.insert(index));
                    }
                }
            }
        }
        assert_eq!(seen.len(), layer.weights_size());
    }

    #[test]
    fn test_output_board_sizes() {
        for (up_board, fs, pad, expected) in [(28, 5, true, 28), (28, 5, false, 24), (5, 5, false, 1)]
        {
            let d = Dims {
                batch: 1,
                up_planes: 1,
                up_board,
                planes: 2,
                fs,
                pad,
            };
            let (_, layer) = build(d, Activation::Linear, false, CpuAccelerator::new(), 1);
            assert_eq!(layer.board_size(), expected);
            assert_eq!(layer.results().len(), 2 * expected * expected);
        }
    }

    #[test]
    fn test_matches_reference_unpadded_biased() {
        let d = Dims {
            batch: 2,
            up_planes: 2,
            up_board: 5,
            planes: 3,
            fs: 3,
            pad: false,
        };
        let (input, layer) = build(d, Activation::Tanh, true, CpuAccelerator::new(), 11);
        let expected = reference_forward(
            d,
            Activation::Tanh,
            input.results(),
            layer.weights(),
            Some(layer.bias_weights()),
        );
        for (got, want) in layer.results().iter().zip(&expected) {
            assert_relative_eq!(*got, *want, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_matches_reference_padded_every_activation() {
        for activation in Activation::ALL {
            let (input, layer) = build(SMALL, activation, true, CpuAccelerator::new(), 5);
            let expected = reference_forward(
                SMALL,
                activation,
                input.results(),
                layer.weights(),
                Some(layer.bias_weights()),
            );
            for (got, want) in layer.results().iter().zip(&expected) {
                assert_relative_eq!(*got, *want, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_padded_launch_size_does_not_change_results() {
        let (_, rounded) = build(SMALL, Activation::Relu, true, CpuAccelerator::with_workgroup_size(7), 9);
        let (_, exact) = build(SMALL, Activation::Relu, true, CpuAccelerator::with_workgroup_size(1), 9);
        assert_eq!(rounded.results(), exact.results());
    }

    #[test]
    fn test_batch_size_mismatch_rejected() {
        let (mut input, mut layer) = build(SMALL, Activation::Linear, false, CpuAccelerator::new(), 2);
        input.set_batch_size(3);
        assert!(matches!(layer.propagate(&input), Err(Error::Shape(_))));
    }

    #[test]
    fn test_timer_records_stages() {
        let (input, layer) = build(SMALL, Activation::Linear, false, CpuAccelerator::new(), 2);
        let timer = StatefulTimer::shared();
        let mut layer = layer.with_timer(timer.clone());
        layer.propagate(&input).unwrap();

        let labels: Vec<String> = timer.borrow().dump().into_iter().map(|(l, _)| l).collect();
        assert!(labels.contains(&"layer 1 propagate, START".to_string()));
        assert!(labels.contains(&"layer 1 propagate, after copy to host".to_string()));
    }
}

// ============================================================================
// Weight Gradient Tests
// ============================================================================

mod weight_gradient_tests {
    use super::*;

    #[test]
    fn test_weight_changes_match_reference_padded() {
        let (input, layer) = build(SMALL, Activation::Tanh, false, CpuAccelerator::new(), 21);
        let mut rng = SimpleRng::new(99);
        let errors = random_vec(&mut rng, layer.results_size());

        let got = layer.weight_changes(0.1, &errors, &input).unwrap();
        let want = reference_weight_changes(
            SMALL,
            Activation::Tanh,
            0.1,
            input.results(),
            layer.results(),
            &errors,
        );
        assert_eq!(got.len(), 3 * 2 * 3 * 3);
        for (g, w) in got.iter().zip(&want) {
            assert_relative_eq!(*g, *w, epsilon = 1e-6, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_weight_changes_match_reference_unpadded() {
        let d = Dims { pad: false, up_board: 5, ..SMALL };
        let (input, layer) = build(d, Activation::Sigmoid, true, CpuAccelerator::new(), 22);
        let mut rng = SimpleRng::new(98);
        let errors = random_vec(&mut rng, layer.results_size());

        let got = layer.weight_changes(0.1, &errors, &input).unwrap();
        let want = reference_weight_changes(
            d,
            Activation::Sigmoid,
            0.1,
            input.results(),
            layer.results(),
            &errors,
        );
        for (g, w) in got.iter().zip(&want) {
            assert_relative_eq!(*g, *w, epsilon = 1e-6, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_single_weight_sign_convention() {
        let mut input = InputLayer::new(1, 1);
        input.set_batch_size(1);
        input.set_input(&[2.0]).unwrap();
        let config = ConvolutionalConfig::new().num_filters(1).filter_size(1);
        let mut layer = ConvolutionalLayer::new(1, &input, &config, shared(CpuAccelerator::new())).unwrap();
        layer.set_weights(&[0.5]).unwrap();
        layer.propagate(&input).unwrap();
        assert_relative_eq!(layer.results()[0], 1.0);

        // error = 1.0, gradient = x * error = 2.0, change = -0.1 * 2.0
        let upstream_errors = layer.back_prop_expected(0.1, &[0.0], &input).unwrap();
        assert!(upstream_errors.is_none());
        assert_relative_eq!(layer.weights()[0], 0.3, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_errors_leave_weights_unchanged() {
        let (input, mut layer) = build(SMALL, Activation::Relu, true, CpuAccelerator::new(), 23);
        let weights = layer.weights().to_vec();
        let bias = layer.bias_weights().to_vec();
        let errors = vec![0.0; layer.results_size()];
        layer.back_prop_errors(0.5, &errors, &input).unwrap();
        assert_eq!(layer.weights(), weights.as_slice());
        assert_eq!(layer.bias_weights(), bias.as_slice());
    }

    #[test]
    fn test_step_decreases_squared_loss() {
        let (input, mut layer) = build(SMALL, Activation::Tanh, true, CpuAccelerator::new(), 24);
        let mut rng = SimpleRng::new(50);
        let mut expected = vec![0.0; layer.results_size()];
        rng.fill_uniform(&mut expected, -0.5, 0.5);

        let before = squared_loss(layer.results(), &expected);
        layer.back_prop_expected(0.05, &expected, &input).unwrap();
        layer.propagate(&input).unwrap();
        let after = squared_loss(layer.results(), &expected);
        assert!(after < before, "loss went from {} to {}", before, after);
    }

    #[test]
    fn test_errors_length_checked() {
        let (input, mut layer) = build(SMALL, Activation::Linear, false, CpuAccelerator::new(), 25);
        let errors = vec![0.0; layer.results_size() - 1];
        assert!(matches!(
            layer.back_prop_errors(0.1, &errors, &input),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn test_empty_batch_rejected_without_touching_weights() {
        let mut input = InputLayer::new(1, 5);
        let config = ConvolutionalConfig::new().num_filters(1).filter_size(3);
        let mut layer =
            ConvolutionalLayer::new(1, &input, &config, shared(CpuAccelerator::new())).unwrap();
        input.set_batch_size(0);
        layer.set_batch_size(0);
        layer.set_weights(&[0.5; 9]).unwrap();

        assert!(matches!(
            layer.weight_changes(0.1, &[], &input),
            Err(Error::Shape(_))
        ));
        assert!(matches!(
            layer.back_prop_errors(0.1, &[], &input),
            Err(Error::Shape(_))
        ));
        assert!(layer.weights().iter().all(|w| w.is_finite()));
        assert_eq!(layer.weights(), &[0.5; 9][..]);
    }
}

// ============================================================================
// Bias Gradient Tests
// ============================================================================

mod bias_gradient_tests {
    use super::*;

    #[test]
    fn test_bias_changes_linear() {
        let d = Dims {
            batch: 2,
            up_planes: 1,
            up_board: 3,
            planes: 2,
            fs: 3,
            pad: true,
        };
        let (_, layer) = build(d, Activation::Linear, true, CpuAccelerator::new(), 31);
        let mut rng = SimpleRng::new(7);
        let errors = random_vec(&mut rng, layer.results_size());

        let changes = layer.bias_weight_changes(0.2, &errors).unwrap();
        assert_eq!(changes.len(), 2);
        let multiplier = 0.2 / 2.0 / 3.0;
        for (o, change) in changes.iter().enumerate() {
            let mut sum = 0.0f32;
            for n in 0..2 {
                for i in 0..9 {
                    sum += errors[(n * 2 + o) * 9 + i];
                }
            }
            assert_relative_eq!(*change, -multiplier * sum, epsilon = 1e-6, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_bias_changes_use_activation_derivative() {
        let (_, layer) = build(SMALL, Activation::Sigmoid, true, CpuAccelerator::new(), 32);
        let errors = vec![1.0; layer.results_size()];
        let changes = layer.bias_weight_changes(0.1, &errors).unwrap();

        let board = 4;
        let multiplier = 0.1 / 2.0 / board as f32;
        for (o, change) in changes.iter().enumerate() {
            let mut sum = 0.0f32;
            for n in 0..2 {
                for r in 0..board {
                    for c in 0..board {
                        let y = layer.result(n, o, r, c);
                        sum += y * (1.0 - y);
                    }
                }
            }
            assert_relative_eq!(*change, -multiplier * sum, epsilon = 1e-6, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_back_prop_applies_bias_changes() {
        let (input, mut layer) = build(SMALL, Activation::Tanh, true, CpuAccelerator::new(), 33);
        let mut rng = SimpleRng::new(8);
        let errors = random_vec(&mut rng, layer.results_size());
        let before = layer.bias_weights().to_vec();
        let changes = layer.bias_weight_changes(0.1, &errors).unwrap();

        layer.back_prop_errors(0.1, &errors, &input).unwrap();
        for ((after, before), change) in layer.bias_weights().iter().zip(&before).zip(&changes) {
            assert_relative_eq!(*after, before + change, epsilon = 1e-7);
        }
    }
}

// ============================================================================
// Upstream Error Tests
// ============================================================================

mod upstream_error_tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum()
    }

    #[test]
    fn test_upstream_errors_are_adjoint_of_forward() {
        for pad in [true, false] {
            let d = Dims { pad, up_board: 5, ..SMALL };
            let (input, layer) = build(d, Activation::Linear, false, CpuAccelerator::new(), 41);
            let mut rng = SimpleRng::new(3);
            let errors = random_vec(&mut rng, layer.results_size());

            let upstream_errors = layer.calc_errors_for_upstream(&errors).unwrap();
            assert_eq!(upstream_errors.len(), input.results_size());
            let lhs = dot(layer.results(), &errors);
            let rhs = dot(input.results(), &upstream_errors);
            assert_relative_eq!(lhs, rhs, epsilon = 1e-4, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_upstream_errors_use_pre_update_weights() {
        let mut rng = SimpleRng::new(12);
        let mut input = InputLayer::new(1, 6);
        input.set_batch_size(2);
        input.set_input(&random_vec(&mut rng, 72)).unwrap();

        let accelerator = shared(CpuAccelerator::new());
        let first_config = ConvolutionalConfig::new().num_filters(2).filter_size(3).tanh();
        let mut first = ConvolutionalLayer::new(1, &input, &first_config, Rc::clone(&accelerator)).unwrap();
        first.randomize_weights(&mut rng);
        first.propagate(&input).unwrap();

        let second_config = ConvolutionalConfig::new().num_filters(3).filter_size(3).pad_zeros().biased();
        let mut second = ConvolutionalLayer::new(2, &first, &second_config, accelerator).unwrap();
        second.randomize_weights(&mut rng);
        second.propagate(&first).unwrap();

        let errors = random_vec(&mut rng, second.results_size());
        let expected = second.calc_errors_for_upstream(&errors).unwrap();
        let got = second
            .back_prop_errors(0.5, &errors, &first)
            .unwrap()
            .expect("convolutional upstream wants errors");

        assert_eq!(got, expected);
        assert_ne!(second.calc_errors_for_upstream(&errors).unwrap(), expected);
    }

    #[test]
    fn test_no_upstream_errors_for_input_layer() {
        let (input, mut layer) = build(SMALL, Activation::Linear, false, CpuAccelerator::new(), 43);
        let errors = vec![0.1; layer.results_size()];
        assert!(layer.back_prop_errors(0.1, &errors, &input).unwrap().is_none());
    }

    #[test]
    fn test_shared_accelerator_leaks_no_buffers() {
        let cpu = Rc::new(RefCell::new(CpuAccelerator::new()));
        let mut input = InputLayer::new(2, 4);
        input.set_batch_size(2);
        let config = ConvolutionalConfig::new().num_filters(3).filter_size(3).pad_zeros().biased();
        let mut layer = ConvolutionalLayer::new(1, &input, &config, cpu.clone()).unwrap();
        layer.propagate(&input).unwrap();
        let errors = vec![0.1; layer.results_size()];
        layer.back_prop_errors(0.1, &errors, &input).unwrap();
        layer.calc_errors_for_upstream(&errors).unwrap();

        assert_eq!(cpu.borrow().live_buffers(), 0);
    }
}
