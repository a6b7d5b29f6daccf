//! Trains a one-layer softmax classifier (`softmax(x · W + b)`) on the
//! MNIST handwritten digits and checkpoints the learned parameters.

pub mod data;
pub mod model;
pub mod training;
