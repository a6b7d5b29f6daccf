use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, vision::MnistItem},
    },
    prelude::*,
};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

#[derive(Clone, Default)]
pub struct MnistBatcher;

/// A materialized batch: flattened images, one-hot targets and the raw
/// class indices (used for accuracy).
#[derive(Clone, Debug)]
pub struct MnistBatch<B: Backend> {
    pub images: Tensor<B, 2>,
    pub targets: Tensor<B, 2>,
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, MnistItem, MnistBatch<B>> for MnistBatcher {
    fn batch(&self, items: Vec<MnistItem>, device: &B::Device) -> MnistBatch<B> {
        let images = items
            .iter()
            .map(|item| TensorData::from(item.image).convert::<B::FloatElem>())
            .map(|data| Tensor::<B, 2>::from_data(data, device))
            .map(|tensor| tensor.reshape([1, 784]))
            // Pixel intensities in [0, 1].
            .map(|tensor| tensor / 255)
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                let mut row = [0.0f32; 10];
                row[item.label as usize] = 1.0;
                TensorData::from([row]).convert::<B::FloatElem>()
            })
            .map(|data| Tensor::<B, 2>::from_data(data, device))
            .collect();

        let labels = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    [(item.label as i64).elem::<B::IntElem>()],
                    device,
                )
            })
            .collect();

        MnistBatch {
            images: Tensor::cat(images, 0),
            targets: Tensor::cat(targets, 0),
            labels: Tensor::cat(labels, 0),
        }
    }
}

/// Draws fixed-size batches from the training partition in shuffled
/// passes: without replacement within one pass, reshuffled at every pass
/// boundary. A fixed seed reproduces the exact batch sequence.
pub struct BatchSampler<D> {
    dataset: D,
    batch_size: usize,
    indices: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl<D: Dataset<MnistItem>> BatchSampler<D> {
    pub fn new(dataset: D, batch_size: usize, seed: u64) -> Self {
        let len = dataset.len();
        assert!(
            batch_size > 0 && batch_size <= len,
            "batch size must be non-zero and fit in the dataset"
        );

        Self {
            dataset,
            batch_size,
            indices: (0..len).collect(),
            // Forces a shuffle on the first draw.
            cursor: len,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_batch(&mut self) -> Vec<MnistItem> {
        if self.cursor + self.batch_size > self.indices.len() {
            self.indices.shuffle(&mut self.rng);
            self.cursor = 0;
        }

        let batch = self.indices[self.cursor..self.cursor + self.batch_size]
            .iter()
            .map(|index| {
                self.dataset
                    .get(*index)
                    .expect("index is within dataset bounds")
            })
            .collect();
        self.cursor += self.batch_size;

        batch
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of items in the underlying training partition.
    pub fn dataset_len(&self) -> usize {
        self.indices.len()
    }
}
