use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{
            Dataset,
            vision::{MnistDataset, MnistItem},
        },
    },
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer, SgdConfig},
    prelude::*,
    record::{CompactRecorder, RecorderError},
    tensor::backend::AutodiffBackend,
};

use crate::{
    data::{BatchSampler, MnistBatch, MnistBatcher},
    model::{MetricsSnapshot, SoftmaxModel, SoftmaxModelConfig, cross_entropy_loss},
};

/// Variant prefix for generated artifact directories.
const MODEL_PREFIX: &str = "1_softmax";

/// Fatal conditions of a training run. Anything else (dataset download,
/// numeric faults) aborts inside the tensor library.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("artifact io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to record checkpoint: {0}")]
    Recorder(#[from] RecorderError),
}

#[derive(Config)]
pub struct TrainingConfig {
    pub model: SoftmaxModelConfig,
    pub optimizer: SgdConfig,
    #[config(default = 2000)]
    pub num_iterations: usize,
    #[config(default = 100)]
    pub batch_size: usize,
    #[config(default = 0)]
    pub seed: u64,
    #[config(default = 5e-3)]
    pub learning_rate: f64,
}

/// Appends one `iteration,loss,accuracy` line per reading.
struct FileMetricLogger {
    writer: BufWriter<File>,
}

impl FileMetricLogger {
    fn new(path: PathBuf) -> Result<Self, TrainingError> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }

    fn log(&mut self, iteration: usize, metrics: &MetricsSnapshot) -> Result<(), TrainingError> {
        writeln!(
            self.writer,
            "{},{},{}",
            iteration, metrics.loss, metrics.accuracy
        )?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Explicitly owned run state: the artifact directory, the metric logs
/// and the checkpoint writer. Created at startup, flushed by
/// [`TrainingContext::finish`].
pub struct TrainingContext {
    artifact_dir: PathBuf,
    train_metrics: FileMetricLogger,
    test_metrics: FileMetricLogger,
}

impl TrainingContext {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Result<Self, TrainingError> {
        let artifact_dir = artifact_dir.into();
        fs::create_dir_all(&artifact_dir)?;

        Ok(Self {
            train_metrics: FileMetricLogger::new(artifact_dir.join("train.log"))?,
            test_metrics: FileMetricLogger::new(artifact_dir.join("test.log"))?,
            artifact_dir,
        })
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Report train-batch metrics for one iteration.
    pub fn log_train(
        &mut self,
        iteration: usize,
        metrics: &MetricsSnapshot,
    ) -> Result<(), TrainingError> {
        println!("{}: accuracy:{} loss: {}", iteration, metrics.accuracy, metrics.loss);
        self.train_metrics.log(iteration, metrics)
    }

    /// Report full-test-set metrics for one iteration.
    pub fn log_test(
        &mut self,
        iteration: usize,
        epoch: usize,
        metrics: &MetricsSnapshot,
    ) -> Result<(), TrainingError> {
        println!(
            "{}: ********* epoch {} ********* test accuracy:{} test loss: {}",
            iteration, epoch, metrics.accuracy, metrics.loss
        );
        self.test_metrics.log(iteration, metrics)
    }

    /// Persist the model parameters under the artifact directory.
    pub fn checkpoint<B: Backend>(&self, model: &SoftmaxModel<B>) -> Result<(), TrainingError> {
        let path = self.artifact_dir.join("model");
        model.clone().save_file(path.clone(), &CompactRecorder::new())?;
        log::info!("checkpoint written to {}", path.display());
        Ok(())
    }

    pub fn finish(mut self) -> Result<(), TrainingError> {
        self.train_metrics.flush()?;
        self.test_metrics.flush()
    }
}

/// The training loop proper. Updates are strictly sequential: step `n + 1`
/// always observes the parameters produced by step `n`, and metrics
/// emitted during a step reflect the parameters before that step's update.
pub struct TrainingLoop<B, O, D>
where
    B: AutodiffBackend,
    O: Optimizer<SoftmaxModel<B>, B>,
    D: Dataset<MnistItem>,
{
    model: SoftmaxModel<B>,
    optim: O,
    batcher: MnistBatcher,
    sampler: BatchSampler<D>,
    test_batch: MnistBatch<B::InnerBackend>,
    learning_rate: f64,
    device: B::Device,
}

impl<B, O, D> TrainingLoop<B, O, D>
where
    B: AutodiffBackend,
    O: Optimizer<SoftmaxModel<B>, B>,
    D: Dataset<MnistItem>,
{
    pub fn new(
        model: SoftmaxModel<B>,
        optim: O,
        sampler: BatchSampler<D>,
        test_batch: MnistBatch<B::InnerBackend>,
        learning_rate: f64,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            optim,
            batcher: MnistBatcher,
            sampler,
            test_batch,
            learning_rate,
            device,
        }
    }

    /// Run one iteration: optionally report metrics computed with the
    /// pre-update parameters, then apply a single gradient-descent step on
    /// a fresh training batch.
    pub fn step(
        &mut self,
        iteration: usize,
        emit_train_metrics: bool,
        emit_test_metrics: bool,
        context: &mut TrainingContext,
    ) -> Result<(), TrainingError> {
        let items = self.sampler.next_batch();

        if emit_train_metrics {
            let batch: MnistBatch<B::InnerBackend> =
                self.batcher.batch(items.clone(), &self.device);
            let metrics = self.model.valid().evaluate(&batch);
            context.log_train(iteration, &metrics)?;
        }

        if emit_test_metrics {
            let epoch = epoch_number(
                iteration,
                self.sampler.batch_size(),
                self.sampler.dataset_len(),
            );
            let metrics = self.model.valid().evaluate(&self.test_batch);
            context.log_test(iteration, epoch, &metrics)?;
        }

        let batch: MnistBatch<B> = self.batcher.batch(items, &self.device);
        let output = self.model.forward(batch.images);
        let loss = cross_entropy_loss(output, batch.targets);
        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self.optim.step(self.learning_rate, self.model.clone(), grads);

        Ok(())
    }

    pub fn model(&self) -> &SoftmaxModel<B> {
        &self.model
    }

    pub fn into_model(self) -> SoftmaxModel<B> {
        self.model
    }
}

/// Epoch reached after `iteration` batches of `batch_size`, starting at 1.
fn epoch_number(iteration: usize, batch_size: usize, train_len: usize) -> usize {
    iteration * batch_size / train_len + 1
}

/// Train a zero-initialized softmax model for `config.num_iterations`
/// steps, reporting train-batch and full-test-set metrics at every step,
/// and write exactly one checkpoint under `artifact_dir`.
pub fn train<B, D, T>(
    artifact_dir: &Path,
    config: &TrainingConfig,
    dataset_train: D,
    dataset_test: T,
    device: B::Device,
) -> Result<SoftmaxModel<B>, TrainingError>
where
    B: AutodiffBackend,
    D: Dataset<MnistItem>,
    T: Dataset<MnistItem>,
{
    B::seed(config.seed);

    let mut context = TrainingContext::new(artifact_dir)?;
    config.save(artifact_dir.join("config.json"))?;

    let model = config.model.init::<B>(&device);
    let optim = config.optimizer.init();
    let sampler = BatchSampler::new(dataset_train, config.batch_size, config.seed);

    let batcher = MnistBatcher;
    let test_items: Vec<MnistItem> = dataset_test.iter().collect();
    let test_batch: MnistBatch<B::InnerBackend> = batcher.batch(test_items, &device);

    let mut training_loop = TrainingLoop::new(
        model,
        optim,
        sampler,
        test_batch,
        config.learning_rate,
        device,
    );

    for iteration in 1..=config.num_iterations {
        training_loop.step(iteration, true, true, &mut context)?;
    }

    let model = training_loop.into_model();
    context.checkpoint(&model)?;
    context.finish()?;

    Ok(model)
}

/// Directory for one run's artifacts, unique per invocation.
fn generate_artifact_dir(prefix: &str) -> PathBuf {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    PathBuf::from("artifacts").join(format!("{prefix}-{seconds}"))
}

/// Load the MNIST split once, train for the full iteration budget and
/// checkpoint the result.
pub fn run<B: AutodiffBackend>(device: B::Device) -> Result<(), TrainingError> {
    let config = TrainingConfig::new(SoftmaxModelConfig::new(), SgdConfig::new());

    log::info!("loading MNIST train/test split");
    let dataset_train = MnistDataset::train();
    let dataset_test = MnistDataset::test();
    log::info!(
        "loaded {} train / {} test images",
        dataset_train.len(),
        dataset_test.len()
    );

    let artifact_dir = generate_artifact_dir(MODEL_PREFIX);
    log::info!("writing artifacts to {}", artifact_dir.display());
    train::<B, _, _>(&artifact_dir, &config, dataset_train, dataset_test, device)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray, ndarray::NdArrayDevice};
    use burn::data::dataset::InMemDataset;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn items(count: usize) -> Vec<MnistItem> {
        (0..count)
            .map(|i| {
                let mut image = [[0.0f32; 28]; 28];
                image[i % 28][(i * 3) % 28] = 255.0;
                image[(i * 5) % 28][i % 28] = 128.0;
                MnistItem {
                    image,
                    label: (i % 10) as u8,
                }
            })
            .collect()
    }

    fn test_config(iterations: usize) -> TrainingConfig {
        TrainingConfig::new(SoftmaxModelConfig::new(), SgdConfig::new())
            .with_num_iterations(iterations)
            .with_batch_size(4)
    }

    #[test]
    fn epoch_number_follows_integer_batch_arithmetic() {
        assert_eq!(epoch_number(1, 100, 60_000), 1);
        assert_eq!(epoch_number(599, 100, 60_000), 1);
        assert_eq!(epoch_number(600, 100, 60_000), 2);
        assert_eq!(epoch_number(601, 100, 60_000), 2);
        assert_eq!(epoch_number(1200, 100, 60_000), 3);
    }

    #[test]
    fn fixed_seed_runs_produce_identical_parameters() {
        let device = NdArrayDevice::Cpu;
        let config = test_config(5);
        let dir_left = tempfile::tempdir().unwrap();
        let dir_right = tempfile::tempdir().unwrap();

        let model_left = train::<TestBackend, _, _>(
            dir_left.path(),
            &config,
            InMemDataset::new(items(12)),
            InMemDataset::new(items(6)),
            device,
        )
        .unwrap();
        let model_right = train::<TestBackend, _, _>(
            dir_right.path(),
            &config,
            InMemDataset::new(items(12)),
            InMemDataset::new(items(6)),
            device,
        )
        .unwrap();

        let (weight_left, bias_left) = model_left.parameters();
        let (weight_right, bias_right) = model_right.parameters();
        assert_eq!(weight_left.into_data(), weight_right.into_data());
        assert_eq!(bias_left.into_data(), bias_right.into_data());
    }

    #[test]
    fn training_reduces_the_loss() {
        let device = NdArrayDevice::Cpu;
        let config = test_config(20);
        let dir = tempfile::tempdir().unwrap();

        let trained = train::<TestBackend, _, _>(
            dir.path(),
            &config,
            InMemDataset::new(items(12)),
            InMemDataset::new(items(6)),
            device,
        )
        .unwrap();

        let batch = MnistBatcher.batch(items(12), &device);
        let untrained = config.model.init::<TestBackend>(&device);

        let before = untrained.evaluate(&batch);
        let after = trained.evaluate(&batch);
        assert!(after.loss < before.loss);
        assert!(after.loss >= 0.0);
        assert!((0.0..=1.0).contains(&after.accuracy));
    }

    #[test]
    fn run_writes_exactly_one_checkpoint_with_expected_shapes() {
        let device = NdArrayDevice::Cpu;
        let config = test_config(3);
        let dir = tempfile::tempdir().unwrap();

        let trained = train::<TestBackend, _, _>(
            dir.path(),
            &config,
            InMemDataset::new(items(12)),
            InMemDataset::new(items(6)),
            device,
        )
        .unwrap();

        assert!(dir.path().join("model.mpk").exists());
        assert!(dir.path().join("config.json").exists());
        assert!(dir.path().join("train.log").exists());
        assert!(dir.path().join("test.log").exists());

        let checkpoints = fs::read_dir(dir.path())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("model")
            })
            .count();
        assert_eq!(checkpoints, 1);

        let restored = SoftmaxModelConfig::new()
            .init::<NdArray<f32>>(&device)
            .load_file(dir.path().join("model"), &CompactRecorder::new(), &device)
            .unwrap();

        let (weight, bias) = restored.parameters();
        assert_eq!(weight.dims(), [784, 10]);
        assert_eq!(bias.dims(), [10]);

        let (trained_weight, trained_bias) = trained.valid().parameters();
        assert_eq!(weight.into_data(), trained_weight.into_data());
        assert_eq!(bias.into_data(), trained_bias.into_data());
    }
}
