use burn::{
    nn::{Initializer, Linear, LinearConfig},
    prelude::*,
    tensor::activation::log_softmax,
};

use crate::data::MnistBatch;

/// Scales the batch-mean cross-entropy up to the total over a 100-image
/// batch, the magnitude the 0.005 learning rate was tuned against.
pub const LOSS_SCALE: f32 = 100.0;

#[derive(Config, Debug)]
pub struct SoftmaxModelConfig {
    #[config(default = 784)]
    pub num_inputs: usize,
    #[config(default = 10)]
    pub num_classes: usize,
}

impl SoftmaxModelConfig {
    /// Initialize the model with zeroed weights and bias.
    pub fn init<B: Backend>(&self, device: &B::Device) -> SoftmaxModel<B> {
        SoftmaxModel {
            linear: LinearConfig::new(self.num_inputs, self.num_classes)
                .with_initializer(Initializer::Zeros)
                .init(device),
        }
    }
}

/// One-layer classifier: `softmax(x · W + b)` over the 10 digit classes.
#[derive(Module, Debug)]
pub struct SoftmaxModel<B: Backend> {
    linear: Linear<B>,
}

impl<B: Backend> SoftmaxModel<B> {
    /// Class scores for a batch of flattened images `[batch, 784]`.
    pub fn forward(&self, images: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(images)
    }

    /// Loss and accuracy of the current parameters on a batch, without
    /// updating them. Two calls on the same batch return the same numbers.
    pub fn evaluate(&self, batch: &MnistBatch<B>) -> MetricsSnapshot {
        let output = self.forward(batch.images.clone());
        let loss = cross_entropy_loss(output.clone(), batch.targets.clone());

        MetricsSnapshot {
            loss: loss.into_scalar().elem(),
            accuracy: accuracy(output, batch.labels.clone()),
        }
    }

    /// Weight matrix `[num_inputs, num_classes]` and bias vector
    /// `[num_classes]`.
    pub fn parameters(&self) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let weight = self.linear.weight.val();
        let bias = self
            .linear
            .bias
            .as_ref()
            .expect("linear layer is built with a bias")
            .val();

        (weight, bias)
    }
}

/// Batch-mean categorical cross-entropy between `softmax(logits)` and
/// one-hot targets, scaled by [`LOSS_SCALE`].
pub fn cross_entropy_loss<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let log_probs = log_softmax(logits, 1);

    (targets * log_probs)
        .sum_dim(1)
        .neg()
        .mean()
        .mul_scalar(LOSS_SCALE)
}

/// Fraction of rows whose highest score matches the label, in `[0, 1]`.
pub fn accuracy<B: Backend>(output: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> f32 {
    let [batch_size, _num_classes] = output.dims();
    let predictions = output.argmax(1).reshape([batch_size]);
    let correct = predictions
        .equal(labels)
        .int()
        .sum()
        .into_scalar()
        .elem::<f32>();

    correct / batch_size as f32
}

/// A point-in-time (loss, accuracy) reading; logged, never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub loss: f32,
    pub accuracy: f32,
}
