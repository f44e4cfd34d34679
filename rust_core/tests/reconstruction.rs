use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tomomc_core::config::ProblemConfig;
use tomomc_core::forward::{ForwardModel, MemoryCache, OperatorKey};
use tomomc_core::geometry::AngleSpec;
use tomomc_core::hmc::HmcConfig;
use tomomc_core::image::Raster;
use tomomc_core::map::{self, MapConfig};
use tomomc_core::prior::{Prior, PriorFamily};
use tomomc_core::progress::{spawn_progress_thread, ProgressState};
use tomomc_core::record::{relative_l2_error, JsonFileSink, ReconstructionRecord, ResultSink};
use tomomc_core::{reconstruct, Estimator, LogDensity, PosteriorContext};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 16×16 bright square, 20 angles, noiseless data.
fn square_problem(n: usize, noise: f64, seed: u64) -> (Raster, PosteriorContext) {
    let model = ForwardModel::default();
    let op = Arc::new(model.build(n, &AngleSpec::UniformCount(20)).unwrap());
    let image = Raster::square_phantom(n, 0.25, 0.75, 1.0).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let y = model.simulate(&op, &image, noise, &mut rng).unwrap();
    let ctx = PosteriorContext::new(op, &y, 0.5).unwrap();
    (image, ctx)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Conjugate gradients on the normal equations `AᵀA x = Aᵀy`.
fn least_squares(ctx: &PosteriorContext) -> Vec<f64> {
    let a = ctx.forward().matrix();
    let normal = |v: &[f64]| a.apply_transpose(&a.apply(v));
    let b = a.apply_transpose(ctx.data());
    let mut x = vec![0.0; b.len()];
    let mut r = b.clone();
    let mut p = r.clone();
    let mut rs = dot(&r, &r);
    for _ in 0..2000 {
        let hp = normal(&p);
        let step = rs / dot(&p, &hp);
        x.iter_mut().zip(&p).for_each(|(xi, pi)| *xi += step * pi);
        r.iter_mut().zip(&hp).for_each(|(ri, hi)| *ri -= step * hi);
        let rs_new = dot(&r, &r);
        if rs_new.sqrt() < 1e-13 {
            break;
        }
        p = r.iter().zip(&p).map(|(ri, pi)| ri + rs_new / rs * pi).collect();
        rs = rs_new;
    }
    x
}

#[test]
fn map_tikhonov_recovers_square() {
    init_logging();
    let (image, ctx) = square_problem(16, 0.0, 1);
    let ctx = ctx.with_prior(Prior::tikhonov(16, 1, 1.0).unwrap()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let estimator = Estimator::Map(MapConfig::default());
    let est = reconstruct(&ctx, &estimator, None, &mut rng, &()).unwrap();

    let err = relative_l2_error(&image.flatten(), &est.x).unwrap();
    let map_est = est.map.as_ref().unwrap();
    assert!(map_est.iterations <= 100);
    assert!(err < 0.3, "relative error {err}");
}

#[test]
fn hmc_mean_is_close_to_map() {
    init_logging();
    let (image, ctx) = square_problem(16, 0.0, 1);
    let ctx = ctx.with_prior(Prior::tikhonov(16, 1, 1.0).unwrap()).unwrap();
    let truth = image.flatten();
    let mut rng = ChaCha8Rng::seed_from_u64(3);

    let map_run = reconstruct(&ctx, &Estimator::Map(MapConfig::default()), None, &mut rng, &())
        .unwrap();
    let map_err = relative_l2_error(&truth, &map_run.x).unwrap();

    let config = HmcConfig {
        num_samples: 50,
        num_warmup: 20,
        target_accept: 0.65,
        ..HmcConfig::default()
    };
    let hmc_run = reconstruct(&ctx, &Estimator::Hmc(config), Some(&map_run.x), &mut rng, &())
        .unwrap();
    let hmc_err = relative_l2_error(&truth, &hmc_run.x).unwrap();
    assert!(hmc_err <= 2.0 * map_err, "HMC {hmc_err} vs MAP {map_err}");
    assert_eq!(hmc_run.diagnostics.draws, 50);
    assert!(hmc_run.diagnostics.stats.final_step_size.unwrap() > 0.0);
}

#[test]
fn unregularized_map_matches_least_squares() {
    init_logging();
    let (_, ctx) = square_problem(8, 0.02, 4);
    let ctx = ctx.with_prior(Prior::tikhonov(8, 1, 0.0).unwrap()).unwrap();
    let x_ls = least_squares(&ctx);

    let config = MapConfig {
        max_iterations: 2000,
        gradient_tolerance: 1e-9,
        objective_tolerance: 0.0,
        ..MapConfig::default()
    };
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let start = map::default_start(64, 0.05, &mut rng);
    let est = map::estimate(&ctx, &start, &config).unwrap();

    let f_ls = -ctx.log_density(&x_ls);
    let gap = est.objective - f_ls;
    assert!(gap.abs() <= 1e-6 * f_ls.max(1e-3), "objective gap {gap}");

    let fit_map = ctx.forward().project(&est.x);
    let fit_ls = ctx.forward().project(&x_ls);
    let mismatch = relative_l2_error(&fit_ls, &fit_map).unwrap();
    assert!(mismatch < 1e-3, "projection mismatch {mismatch}");
}

#[test]
fn fixed_seed_gives_identical_results() {
    let (_, ctx) = square_problem(8, 0.02, 6);
    let ctx = ctx
        .with_prior(Prior::total_variation(8, 2.0, 0.01).unwrap())
        .unwrap();
    let estimator = Estimator::Ehmc(HmcConfig {
        num_samples: 30,
        num_warmup: 20,
        keep_chain: true,
        ..HmcConfig::default()
    });
    let run = || {
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        reconstruct(&ctx, &estimator, None, &mut rng, &()).unwrap()
    };
    let (a, b) = (run(), run());
    assert_eq!(a.x, b.x);
    assert_eq!(a.chain, b.chain);
    assert_eq!(a.trajectory_lengths, b.trajectory_lengths);
}

#[test]
fn full_pipeline_with_cache_progress_and_sink() {
    init_logging();
    let config: ProblemConfig = serde_json::from_str(
        r#"{"grid_size": 12, "angles": {"range": {"start": 0.0, "end": 170.0, "count": 18}},
            "noise_fraction": 0.01, "seed": 7}"#,
    )
    .unwrap();
    config.validate().unwrap();

    let model = ForwardModel::new(config.max_grid_size);
    let mut cache = MemoryCache::new();
    let key = OperatorKey::new(config.grid_size, config.angles);
    let op = model.operator(&mut cache, &key).unwrap();
    let again = model.operator(&mut cache, &key).unwrap();
    assert!(Arc::ptr_eq(&op, &again));

    let image = Raster::square_phantom(config.grid_size, 0.3, 0.6, 1.0).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let y = model.simulate(&op, &image, config.noise_fraction, &mut rng).unwrap();
    let ctx = PosteriorContext::new(op, &y, config.likelihood_variance)
        .unwrap()
        .with_prior(config.prior(PriorFamily::Cauchy, 0.5).unwrap())
        .unwrap();

    let estimator = Estimator::Hmc(HmcConfig {
        num_samples: 40,
        num_warmup: 20,
        keep_chain: true,
        ..HmcConfig::default()
    });
    let progress = Arc::new(ProgressState::new("HMC", 20, 40));
    let handle = spawn_progress_thread(Arc::clone(&progress));
    let est = reconstruct(&ctx, &estimator, None, &mut rng, progress.as_ref()).unwrap();
    progress.finish();
    handle.join().unwrap();
    assert_eq!(
        progress.completed.load(std::sync::atomic::Ordering::Relaxed),
        60
    );

    let record =
        ReconstructionRecord::new(&image, &est, &ctx, config.noise_fraction, config.angles)
            .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut sink = JsonFileSink::new(dir.path());
    sink.store(&record).unwrap();
    let loaded = ReconstructionRecord::load(&sink.written()[0]).unwrap();
    assert_eq!(loaded.metrics, record.metrics);
    assert_eq!(loaded.chain.as_ref().map(|c| c.draws().len()), Some(40));
    assert!(record.diagnostics.to_table().contains("HMC"));
}
