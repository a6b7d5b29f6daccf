use burn::backend::{Autodiff, NdArray, ndarray::NdArrayDevice};
use tracing_subscriber::filter::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let device = NdArrayDevice::Cpu;
    if let Err(err) = mnist_softmax::training::run::<Autodiff<NdArray>>(device) {
        log::error!("training run failed: {err}");
        std::process::exit(1);
    }
}
