mod config;
mod report;

use agecal_core::age::{train_age_estimator, AgeSource, AgeTrainOptions};
use agecal_core::audit::audit;
use agecal_core::calibration::{evaluate_model, fit, FitOptions};
use agecal_core::onnx::{OnnxAgeEstimator, OnnxCalibrator, OnnxEmbedder};
use agecal_core::synthetic::{self, PairProvenance, SyntheticOptions};
use agecal_core::{AgeEstimator, CalibrationModel, Calibrator, LabeledPair, Strategy};
use agecal_data::corpus::{read_pairs, read_records, sha256_file, write_jsonl};
use agecal_data::extract::{extract_corpus, extract_pair_features, faces_from_records, ExtractOptions, LabelSource};
use agecal_data::labels::read_bucket_manifest;
use agecal_data::pairs::{auto_detect, load_pairs, PairDataset};
use agecal_data::SkipCounts;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::Config;
use report::{metrics_line, write_report, CorpusInfo, FitReport};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "agecal", about = "Age-aware face-similarity calibration")]
struct Cli {
    /// TOML config file, applied over AGECAL_* environment variables
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Embedding network (.onnx)
    #[arg(long, global = true)]
    embedder_model: Option<PathBuf>,
    /// Age estimator (.json native or .onnx)
    #[arg(long, global = true)]
    age_model: Option<PathBuf>,
    #[arg(long, global = true)]
    seed: Option<u64>,
    /// Stop after this many samples
    #[arg(long, global = true)]
    sample_cap: Option<usize>,
    /// FAR at which TAR is reported
    #[arg(long, global = true)]
    target_far: Option<f64>,
    /// L2 strength for the constrained linear strategy
    #[arg(long, global = true)]
    regularization: Option<f64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed an image directory into a JSON Lines corpus
    Extract {
        /// Image directory (UTKFace naming unless --unlabeled)
        images: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
        /// Keep images without parsing age labels from file names
        #[arg(long, conflicts_with = "age_buckets")]
        unlabeled: bool,
        /// Bucketed age manifest (FairFace-style CSV with file and age columns)
        #[arg(long)]
        age_buckets: Option<PathBuf>,
    },
    /// Build labeled pair features from AgeDB-30 or CALFW
    Pairs {
        /// Datasets root (auto-detect) or a dataset directory with --dataset
        root: PathBuf,
        #[arg(long, value_enum)]
        dataset: Option<DatasetArg>,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Train the native age estimator on a labeled corpus
    TrainAge {
        corpus: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
        /// Best-so-far snapshot, rewritten on every improvement
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Fit one calibration strategy, or all three
    Fit {
        /// learned, constrained-linear, penalty or all
        #[arg(short, long, default_value = "all")]
        strategy: String,
        /// Verified labeled pair features (JSON Lines)
        #[arg(long, conflicts_with = "corpus", required_unless_present = "corpus")]
        pairs: Option<PathBuf>,
        /// Unlabeled embedding corpus; pairs are labeled by the similarity heuristic
        #[arg(long)]
        corpus: Option<PathBuf>,
        /// Output directory for <strategy>.json and its report
        #[arg(short, long)]
        out_dir: PathBuf,
    },
    /// Score labeled pairs with a fitted model
    Evaluate {
        /// Calibration artifact (.json) or learned calibrator graph (.onnx)
        model: PathBuf,
        #[arg(long)]
        pairs: PathBuf,
        /// Print the full metrics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Probe a fitted model's age sensitivity
    Audit {
        model: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DatasetArg {
    Agedb,
    Calfw,
}

impl From<DatasetArg> for PairDataset {
    fn from(arg: DatasetArg) -> Self {
        match arg {
            DatasetArg::Agedb => PairDataset::AgeDb30,
            DatasetArg::Calfw => PairDataset::Calfw,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    apply_flags(&mut config, &cli);

    match cli.command {
        Commands::Extract {
            images,
            out,
            unlabeled,
            age_buckets,
        } => {
            let mut manifest_skips = SkipCounts::default();
            let labels = match age_buckets {
                Some(path) => {
                    let (ages, skipped) = read_bucket_manifest(&path)
                        .with_context(|| format!("reading age buckets {}", path.display()))?;
                    manifest_skips = skipped;
                    LabelSource::Buckets(ages)
                }
                None if unlabeled => LabelSource::None,
                None => LabelSource::UtkFace,
            };
            let mut embedder = OnnxEmbedder::load(&config.embedder_model)
                .with_context(|| format!("loading embedder {}", config.embedder_model.display()))?;
            let options = ExtractOptions {
                sample_cap: config.sample_cap,
                labels,
            };
            let cancel = cancel_on_ctrl_c();
            let extraction = tokio::task::spawn_blocking(move || extract_corpus(&images, &mut embedder, &options, &cancel))
                .await
                .context("extraction task failed")??;

            write_jsonl(&out, &extraction.records)?;
            println!("{} records written to {}", extraction.records.len(), out.display());
            let mut skipped = extraction.skipped;
            skipped.merge(manifest_skips);
            print_skipped(&skipped);
            if extraction.cancelled {
                println!("interrupted: corpus is partial");
            }
        }
        Commands::Pairs { root, dataset, out } => {
            let list = match dataset {
                Some(dataset) => load_pairs(dataset.into(), &root),
                None => auto_detect(&root),
            }
            .with_context(|| format!("no pair list under {}", root.display()))?;
            let mut embedder = OnnxEmbedder::load(&config.embedder_model)
                .with_context(|| format!("loading embedder {}", config.embedder_model.display()))?;
            let mut ages = load_age_source(&config.age_model)?;
            let sample_cap = config.sample_cap;
            let cancel = cancel_on_ctrl_c();
            let extraction = tokio::task::spawn_blocking(move || {
                extract_pair_features(&list, &mut embedder, ages.as_mut(), sample_cap, &cancel)
            })
            .await
            .context("pair extraction task failed")?;

            write_jsonl(&out, &extraction.pairs)?;
            let same = extraction.pairs.iter().filter(|p| p.same).count();
            println!(
                "{} pairs ({} same, {} different) written to {}",
                extraction.pairs.len(),
                same,
                extraction.pairs.len() - same,
                out.display()
            );
            print_skipped(&extraction.skipped);
            if extraction.cancelled {
                println!("interrupted: pair file is partial");
            }
        }
        Commands::TrainAge { corpus, out, checkpoint } => {
            let loaded = read_records(&corpus)?;
            let mut skipped = loaded.skipped;
            let mut samples = Vec::with_capacity(loaded.items.len());
            for record in &loaded.items {
                match record.to_age_sample() {
                    Some(Ok(sample)) => samples.push(sample),
                    Some(Err(e)) => {
                        skipped.malformed += 1;
                        tracing::warn!(id = %record.id, error = %e, "record skipped");
                    }
                    None => skipped.unlabeled += 1,
                }
            }
            if samples.is_empty() {
                bail!("{} has no labeled records", corpus.display());
            }

            let mut options = AgeTrainOptions::default();
            options.train.seed = config.seed;
            if let Some(path) = checkpoint {
                options = options.with_checkpoint(path);
            }
            let training = tokio::task::spawn_blocking(move || train_age_estimator(&samples, &options))
                .await
                .context("training task failed")??;
            training.estimator.save(&out)?;

            println!(
                "age estimator written to {}: validation MAE {:.2} years over {} samples ({} epochs)",
                out.display(),
                training.validation_mae,
                training.validation_samples,
                training.epochs_run
            );
            skipped.malformed += training.skipped;
            print_skipped(&skipped);
        }
        Commands::Fit {
            strategy,
            pairs,
            corpus,
            out_dir,
        } => {
            let strategies = if strategy.eq_ignore_ascii_case("all") {
                Strategy::ALL.to_vec()
            } else {
                vec![strategy.parse::<Strategy>()?]
            };

            let (pairs, info) = match (pairs, corpus) {
                (Some(path), _) => verified_pairs(&path)?,
                (None, Some(path)) => heuristic_pairs(&path, &config)?,
                (None, None) => bail!("either --pairs or --corpus is required"),
            };

            let options = FitOptions {
                regularization: config.regularization_strength,
                validation_fraction: config.validation_fraction,
                seed: config.seed,
                target_far: config.target_far,
                checkpoint: Some(out_dir.join("learned.checkpoint.json")),
                ..FitOptions::default()
            };
            fit_strategies(strategies, pairs, options, &out_dir, &info).await?;
        }
        Commands::Evaluate { model, pairs, json } => {
            let calibrator = load_calibrator(&model)?;
            let loaded = read_pairs(&pairs)?;
            let metrics = evaluate_model(calibrator.as_ref(), &loaded.items, config.target_far);
            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                println!(
                    "{} pairs ({} same, {} different)",
                    loaded.items.len(),
                    metrics.same_pairs,
                    metrics.different_pairs
                );
                println!("{}", metrics_line(&metrics));
                print_skipped(&loaded.skipped);
            }
        }
        Commands::Audit { model } => {
            let calibrator = load_calibrator(&model)?;
            let report = audit(calibrator.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.collapsed {
                println!(
                    "warning: age sensitivity {:.4}; the model has collapsed to a similarity threshold",
                    report.age_sensitivity
                );
            }
        }
    }

    Ok(())
}

fn apply_flags(config: &mut Config, cli: &Cli) {
    if let Some(path) = &cli.embedder_model {
        config.embedder_model = path.clone();
    }
    if let Some(path) = &cli.age_model {
        config.age_model = path.clone();
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if cli.sample_cap.is_some() {
        config.sample_cap = cli.sample_cap;
    }
    if let Some(far) = cli.target_far {
        config.target_far = far;
    }
    if let Some(lambda) = cli.regularization {
        config.regularization_strength = lambda;
    }
}

/// Flag set by Ctrl-C; long loops check it between samples.
fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current sample");
            flag.store(true, Ordering::Relaxed);
        }
    });
    cancel
}

fn load_age_source(path: &Path) -> Result<Box<dyn AgeSource + Send>> {
    let source: Box<dyn AgeSource + Send> = if has_extension(path, "onnx") {
        Box::new(OnnxAgeEstimator::load(path).with_context(|| format!("loading age model {}", path.display()))?)
    } else {
        Box::new(AgeEstimator::load(path).with_context(|| format!("loading age model {}", path.display()))?)
    };
    Ok(source)
}

fn load_calibrator(path: &Path) -> Result<Box<dyn Calibrator>> {
    let calibrator: Box<dyn Calibrator> = if has_extension(path, "onnx") {
        Box::new(OnnxCalibrator::load(path).with_context(|| format!("loading calibrator {}", path.display()))?)
    } else {
        Box::new(CalibrationModel::load(path).with_context(|| format!("loading calibrator {}", path.display()))?)
    };
    Ok(calibrator)
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn verified_pairs(path: &Path) -> Result<(Vec<LabeledPair>, CorpusInfo)> {
    let loaded = read_pairs(path)?;
    let info = CorpusInfo {
        path: path.to_path_buf(),
        sha256: sha256_file(path)?,
        provenance: PairProvenance::Verified,
        skipped: loaded.skipped,
    };
    Ok((loaded.items, info))
}

fn heuristic_pairs(path: &Path, config: &Config) -> Result<(Vec<LabeledPair>, CorpusInfo)> {
    let loaded = read_records(path)?;
    let mut ages = load_age_source(&config.age_model)?;
    let (faces, face_skips) = faces_from_records(&loaded.items, ages.as_mut());
    let mut skipped = loaded.skipped;
    skipped.merge(face_skips);

    let options = SyntheticOptions {
        negative_pairs: config.negative_pairs,
        positive_pairs: config.positive_pairs,
        window: config.window,
        positive_threshold: config.positive_threshold,
        seed: config.seed,
    };
    let generated = synthetic::generate(&faces, &options)?;
    skipped.malformed += generated.skipped;
    println!("warning: {}", generated.caveat());
    println!(
        "{} heuristic pairs ({} positive of {} candidates, {} negative)",
        generated.pairs.len(),
        generated.positives,
        generated.candidates,
        generated.negatives
    );

    let info = CorpusInfo {
        path: path.to_path_buf(),
        sha256: sha256_file(path)?,
        provenance: generated.provenance(),
        skipped,
    };
    Ok((generated.pairs, info))
}

/// Fit each strategy on its own blocking task, then write artifacts and
/// reports in strategy order.
async fn fit_strategies(
    strategies: Vec<Strategy>,
    pairs: Vec<LabeledPair>,
    options: FitOptions,
    out_dir: &Path,
    info: &CorpusInfo,
) -> Result<()> {
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let pairs = Arc::new(pairs);

    let handles: Vec<_> = strategies
        .into_iter()
        .map(|strategy| {
            let pairs = pairs.clone();
            let options = options.clone();
            (strategy, tokio::task::spawn_blocking(move || fit(strategy, &pairs, &options)))
        })
        .collect();

    for (strategy, handle) in handles {
        let outcome = handle
            .await
            .with_context(|| format!("{strategy} fit task failed"))?
            .with_context(|| format!("fitting {strategy}"))?;

        let artifact = out_dir.join(format!("{strategy}.json"));
        outcome.model.save(&artifact)?;
        let report = FitReport::new(&outcome, &artifact, info);
        write_report(&report)?;

        println!("{strategy}: {}", artifact.display());
        println!("  train      {}", metrics_line(&outcome.train_metrics));
        println!("  validation {}", metrics_line(&outcome.validation_metrics));
        if let Some(err) = &outcome.convergence {
            println!("  warning: {err}; model flagged unreliable");
        }
    }
    print_skipped(&info.skipped);
    Ok(())
}

fn print_skipped(skipped: &SkipCounts) {
    if skipped.total() > 0 {
        println!(
            "skipped {} (unlabeled {}, unreadable {}, malformed {})",
            skipped.total(),
            skipped.unlabeled,
            skipped.unreadable,
            skipped.malformed
        );
    }
}
