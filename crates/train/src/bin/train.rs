//! CLI for learning a curriculum with a Generative Teaching Network.

use std::path::PathBuf;

use candle_core::{Device, Tensor};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;

use gtn_common::{Batch, CurriculumConfig, GtnConfig, TensorDataset};
use gtn_core::{Accuracy, Learner, Mlp, MlpTeacher};
use gtn_train::{Curriculum, DataCurriculum, FixedNoiseTeacher, Gtn, RandomNoiseTeacher};

#[derive(Parser, Debug)]
#[command(name = "gtn-train", about = "Learn a training curriculum for a learner population")]
struct Args {
    #[arg(long, default_value = "gtn.json")]
    config: PathBuf,
    /// Safetensors dataset (`data`, `labels`). Synthesised if absent.
    #[arg(long)]
    train_data: Option<PathBuf>,
    #[arg(long)]
    test_data: Option<PathBuf>,
    /// Overrides `output_dir` from the config.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Overrides `epochs` from the config.
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long, default_value = "4")]
    population: usize,
    /// Learner hidden layer sizes.
    #[arg(long, value_delimiter = ',', default_value = "64")]
    hidden: Vec<usize>,
    /// Teacher hidden layer sizes.
    #[arg(long, value_delimiter = ',', default_value = "256")]
    teacher_hidden: Vec<usize>,
    /// Batch size of the outer train / validation streams and of the data
    /// curriculum.
    #[arg(long, default_value = "64")]
    data_batch: usize,
    /// Inner steps of the data curriculum.
    #[arg(long, default_value = "16")]
    curriculum_steps: usize,
    #[arg(long, default_value = "42")]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // Load or create config
    let config = if args.config.exists() {
        GtnConfig::load(&args.config)?
    } else {
        let default = GtnConfig::default();
        default.save(&args.config)?;
        eprintln!("Created default config at {}", args.config.display());
        default
    };
    config.validate()?;
    let output_dir = args.output_dir.clone().unwrap_or(config.output_dir.clone());
    let epochs = args.epochs.unwrap_or(config.epochs);

    let device = Device::cuda_if_available(0)?;
    // candle's CPU backend has no seedable generator
    if !device.is_cpu() {
        device.set_seed(args.seed)?;
    }
    let mut rng = StdRng::seed_from_u64(args.seed);

    let train_ds = load_or_synthesise(&args.train_data, 2048, &config, &device)?;
    let test_ds = load_or_synthesise(&args.test_data, 512, &config, &device)?;
    eprintln!(
        "Train: {} samples, test: {} samples",
        train_ds.len(),
        test_ds.len()
    );
    if train_ds.is_empty() || test_ds.is_empty() {
        anyhow::bail!("train and test datasets must be non-empty");
    }
    let sample_shape = train_ds.data().dims()[1..].to_vec();
    let features: usize = sample_shape.iter().product();

    let train = train_ds.shuffled_batches(args.data_batch, &mut rng)?;
    let test = test_ds.batches(args.data_batch)?;

    let curriculum = build_curriculum(&args, &config, &train_ds, &sample_shape, &device)?;

    let mut dims = vec![features];
    dims.extend_from_slice(&args.hidden);
    dims.push(config.num_classes);
    let learners = (0..args.population)
        .map(|_| Ok(Box::new(Mlp::new(&dims, &device)?) as Box<dyn Learner>))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut gtn = Gtn::builder(config.clone(), device)
        .learners(learners)
        .metrics(Accuracy::new())
        .curriculum(curriculum)
        .build()?;

    let table = gtn.train(&train, &test, &output_dir, epochs)?;

    let history = output_dir.join("history.json");
    table.save_json(&history)?;
    table.save_csv(&output_dir.join("history.csv"))?;
    gtn.save_curriculum(&output_dir)?;
    config.save(&output_dir.join("config.json"))?;

    if let Some(last) = table.rows().last() {
        for (name, value) in last.history.latest() {
            eprintln!("  {name}: {value}");
        }
    }
    eprintln!(
        "Training done. {} learners, history at {}",
        table.len(),
        history.display()
    );
    Ok(())
}

fn load_or_synthesise(
    path: &Option<PathBuf>,
    samples: usize,
    config: &GtnConfig,
    device: &Device,
) -> anyhow::Result<TensorDataset> {
    Ok(match path {
        Some(p) => TensorDataset::load(p, device)?,
        None => TensorDataset::gaussian_blobs(samples, config.num_classes, &[28, 28], 0.5, device)?,
    })
}

fn build_curriculum(
    args: &Args,
    config: &GtnConfig,
    train_ds: &TensorDataset,
    sample_shape: &[usize],
    device: &Device,
) -> anyhow::Result<Curriculum> {
    let curriculum = match &config.curriculum {
        CurriculumConfig::Data => {
            let loader: Vec<Batch> =
                train_ds.curriculum_batches(args.data_batch, args.curriculum_steps)?;
            DataCurriculum::prepare(&loader, device)?.into()
        }
        CurriculumConfig::FixedNoiseTeacher(t) => {
            let teacher = MlpTeacher::new(
                t.noise_size.iter().product(),
                config.num_classes,
                &args.teacher_hidden,
                sample_shape,
                device,
            )?;
            let mut shape = vec![t.inner_loop_iterations, t.inner_batch_size];
            shape.extend_from_slice(&t.noise_size);
            let noise = Tensor::randn(0f32, 1f32, shape, device)?;
            FixedNoiseTeacher::prepare(Box::new(teacher), &noise, config.num_classes)?.into()
        }
        CurriculumConfig::RandomNoiseTeacher(t) => {
            let teacher = MlpTeacher::new(
                t.noise_size.iter().product(),
                config.num_classes,
                &args.teacher_hidden,
                sample_shape,
                device,
            )?;
            RandomNoiseTeacher::prepare(Box::new(teacher), t, config.num_classes, device)?.into()
        }
    };
    Ok(curriculum)
}
