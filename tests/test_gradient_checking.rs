// Numerical gradient checking with central finite differences: the
// analytic gradients from the backward pass must match a perturbation
// estimate of the batch cost for both fully connected and convolutional
// layers.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tensornet::{
    ActivationKind, Backend, ConvolutionalLayer, CostKind, DenseLayer, ReferenceBackend,
    SequentialNetwork, Tensor, TensorShape,
};

const EPSILON: f32 = 1e-2;

fn backend() -> Arc<dyn Backend> {
    Arc::new(ReferenceBackend::new())
}

fn random_tensor(rng: &mut StdRng, shape: TensorShape, entities: usize) -> Tensor {
    let data = (0..shape.size() * entities)
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect();
    Tensor::from_vec(shape, entities, data).unwrap()
}

// Batch cost as a sum over entities, matching the backward pass's
// batch-summed gradients.
fn total_cost(network: &SequentialNetwork, input: &Tensor, expected: &Tensor) -> f32 {
    let output = network.forward(input).unwrap();
    network.cost().value(&output, expected) * input.entities() as f32
}

fn read_param(network: &mut SequentialNetwork, layer: usize, weight: bool, index: usize) -> f32 {
    let (weights, biases) = network.layer_parameters_mut(layer);
    if weight {
        weights[index]
    } else {
        biases[index]
    }
}

fn write_param(
    network: &mut SequentialNetwork,
    layer: usize,
    weight: bool,
    index: usize,
    value: f32,
) {
    let (weights, biases) = network.layer_parameters_mut(layer);
    if weight {
        weights[index] = value;
    } else {
        biases[index] = value;
    }
}

fn numeric_gradient(
    network: &mut SequentialNetwork,
    layer: usize,
    weight: bool,
    index: usize,
    input: &Tensor,
    expected: &Tensor,
) -> f32 {
    let original = read_param(network, layer, weight, index);
    write_param(network, layer, weight, index, original + EPSILON);
    let plus = total_cost(network, input, expected);
    write_param(network, layer, weight, index, original - EPSILON);
    let minus = total_cost(network, input, expected);
    write_param(network, layer, weight, index, original);
    (plus - minus) / (2.0 * EPSILON)
}

fn assert_gradient_close(analytic: f32, numeric: f32, what: &str) {
    let scale = analytic.abs().max(numeric.abs()).max(0.05);
    assert!(
        (analytic - numeric).abs() <= 0.05 * scale,
        "{}: analytic {} vs numeric {}",
        what,
        analytic,
        numeric
    );
}

fn check_network_gradients(network: &mut SequentialNetwork, input: &Tensor, expected: &Tensor) {
    let mut rng = StdRng::seed_from_u64(0x6ead);
    let trace = network.forward_train(input, 0.0, &mut rng).unwrap();
    let gradients = network.backward(&trace, input, expected).unwrap();

    for layer in 0..network.layer_count() {
        let gradient = &gradients[layer];
        // Sample a spread of weights and check every bias.
        let weight_count = gradient.weights.len();
        let samples: Vec<usize> = if weight_count <= 12 {
            (0..weight_count).collect()
        } else {
            (0..12).map(|i| i * weight_count / 12).collect()
        };
        for index in samples {
            let numeric = numeric_gradient(network, layer, true, index, input, expected);
            assert_gradient_close(
                gradient.weights[index],
                numeric,
                &format!("layer {} weight {}", layer, index),
            );
        }
        for index in 0..gradient.biases.len() {
            let numeric = numeric_gradient(network, layer, false, index, input, expected);
            assert_gradient_close(
                gradient.biases[index],
                numeric,
                &format!("layer {} bias {}", layer, index),
            );
        }
    }
}

#[test]
fn test_dense_network_gradients() {
    let mut rng = StdRng::seed_from_u64(42);
    let backend = backend();
    let mut network = SequentialNetwork::new(
        vec![
            Box::new(DenseLayer::new(
                3,
                5,
                ActivationKind::Sigmoid,
                Arc::clone(&backend),
                &mut rng,
            )),
            Box::new(DenseLayer::new(
                5,
                2,
                ActivationKind::Sigmoid,
                backend,
                &mut rng,
            )),
        ],
        CostKind::Quadratic,
    )
    .unwrap();

    let input = random_tensor(&mut rng, TensorShape::linear(3), 2);
    let expected = random_tensor(&mut rng, TensorShape::linear(2), 2);
    check_network_gradients(&mut network, &input, &expected);
}

#[test]
fn test_dense_network_gradients_tanh() {
    let mut rng = StdRng::seed_from_u64(7);
    let backend = backend();
    let mut network = SequentialNetwork::new(
        vec![
            Box::new(DenseLayer::new(
                4,
                6,
                ActivationKind::Tanh,
                Arc::clone(&backend),
                &mut rng,
            )),
            Box::new(DenseLayer::new(
                6,
                3,
                ActivationKind::Sigmoid,
                backend,
                &mut rng,
            )),
        ],
        CostKind::Quadratic,
    )
    .unwrap();

    let input = random_tensor(&mut rng, TensorShape::linear(4), 1);
    let expected = random_tensor(&mut rng, TensorShape::linear(3), 1);
    check_network_gradients(&mut network, &input, &expected);
}

#[test]
fn test_convolutional_network_gradients() {
    let mut rng = StdRng::seed_from_u64(13);
    let backend = backend();
    let input_shape = TensorShape::new(1, 5, 5);
    let mut network = SequentialNetwork::new(
        vec![
            Box::new(
                ConvolutionalLayer::new(
                    input_shape,
                    2,
                    (3, 3),
                    1,
                    1,
                    ActivationKind::Tanh,
                    Arc::clone(&backend),
                    &mut rng,
                )
                .unwrap(),
            ),
            Box::new(DenseLayer::new(
                2 * 5 * 5,
                2,
                ActivationKind::Sigmoid,
                backend,
                &mut rng,
            )),
        ],
        CostKind::Quadratic,
    )
    .unwrap();

    let input = random_tensor(&mut rng, input_shape, 2);
    let expected = random_tensor(&mut rng, TensorShape::linear(2), 2);
    check_network_gradients(&mut network, &input, &expected);
}

#[test]
fn test_strided_convolution_gradients() {
    let mut rng = StdRng::seed_from_u64(99);
    let backend = backend();
    let input_shape = TensorShape::new(2, 7, 7);
    let mut network = SequentialNetwork::new(
        vec![
            Box::new(
                ConvolutionalLayer::new(
                    input_shape,
                    3,
                    (3, 3),
                    2,
                    0,
                    ActivationKind::Sigmoid,
                    Arc::clone(&backend),
                    &mut rng,
                )
                .unwrap(),
            ),
            Box::new(DenseLayer::new(
                3 * 3 * 3,
                2,
                ActivationKind::Sigmoid,
                backend,
                &mut rng,
            )),
        ],
        CostKind::Quadratic,
    )
    .unwrap();

    let input = random_tensor(&mut rng, input_shape, 1);
    let expected = random_tensor(&mut rng, TensorShape::linear(2), 1);
    check_network_gradients(&mut network, &input, &expected);
}

#[test]
fn test_cross_entropy_output_gradients() {
    let mut rng = StdRng::seed_from_u64(21);
    let backend = backend();
    let mut network = SequentialNetwork::new(
        vec![Box::new(DenseLayer::new(
            4,
            3,
            ActivationKind::Sigmoid,
            backend,
            &mut rng,
        ))],
        CostKind::CrossEntropy,
    )
    .unwrap();

    let input = random_tensor(&mut rng, TensorShape::linear(4), 2);
    // Targets strictly inside (0, 1) keep the cost smooth around the
    // operating point.
    let expected = Tensor::from_vec(
        TensorShape::linear(3),
        2,
        vec![0.8, 0.2, 0.5, 0.3, 0.9, 0.1],
    )
    .unwrap();
    check_network_gradients(&mut network, &input, &expected);
}

#[test]
fn test_stacked_convolution_gradients() {
    // Two convolution layers: checking the first layer's gradients drives
    // the second layer's backward-data pass through the transposed kernel.
    let mut rng = StdRng::seed_from_u64(31);
    let backend = backend();
    let input_shape = TensorShape::new(1, 6, 6);
    let mut network = SequentialNetwork::new(
        vec![
            Box::new(
                ConvolutionalLayer::new(
                    input_shape,
                    2,
                    (3, 3),
                    1,
                    1,
                    ActivationKind::Tanh,
                    Arc::clone(&backend),
                    &mut rng,
                )
                .unwrap(),
            ),
            Box::new(
                ConvolutionalLayer::new(
                    TensorShape::new(2, 6, 6),
                    2,
                    (3, 3),
                    1,
                    1,
                    ActivationKind::Sigmoid,
                    Arc::clone(&backend),
                    &mut rng,
                )
                .unwrap(),
            ),
            Box::new(DenseLayer::new(
                2 * 6 * 6,
                2,
                ActivationKind::Sigmoid,
                backend,
                &mut rng,
            )),
        ],
        CostKind::Quadratic,
    )
    .unwrap();

    let input = random_tensor(&mut rng, input_shape, 1);
    let expected = random_tensor(&mut rng, TensorShape::linear(2), 1);
    check_network_gradients(&mut network, &input, &expected);
}

#[test]
fn test_conv_pool_dense_gradients() {
    use tensornet::PoolingLayer;

    // The pooling layer sits between convolution and dense, so checking
    // the convolution gradients routes deltas through the pooling backward
    // pass. Unit windows keep the argmax stable under the finite
    // perturbation; a max-pool gradient is not differentiable at a window
    // tie.
    let mut rng = StdRng::seed_from_u64(57);
    let backend = backend();
    let input_shape = TensorShape::new(1, 6, 6);
    let mut network = SequentialNetwork::new(
        vec![
            Box::new(
                ConvolutionalLayer::new(
                    input_shape,
                    4,
                    (3, 3),
                    1,
                    1,
                    ActivationKind::Tanh,
                    Arc::clone(&backend),
                    &mut rng,
                )
                .unwrap(),
            ),
            Box::new(
                PoolingLayer::new(
                    TensorShape::new(4, 6, 6),
                    1,
                    1,
                    ActivationKind::Identity,
                    Arc::clone(&backend),
                )
                .unwrap(),
            ),
            Box::new(DenseLayer::new(
                4 * 6 * 6,
                2,
                ActivationKind::Sigmoid,
                backend,
                &mut rng,
            )),
        ],
        CostKind::Quadratic,
    )
    .unwrap();

    let input = random_tensor(&mut rng, input_shape, 1);
    let expected = random_tensor(&mut rng, TensorShape::linear(2), 1);
    check_network_gradients(&mut network, &input, &expected);
}
