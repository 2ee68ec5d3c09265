use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use nbglm::{DesignMatrix, FitConfig, FitData, Strategy, fit_glm};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Gamma, Poisson};

const N_OBSERVATIONS: usize = 200;

fn simulated_counts(n_features: usize) -> FitData {
    let mut rng = StdRng::seed_from_u64(0x5EED_0B5 + n_features as u64);
    let mut design = Array2::ones((N_OBSERVATIONS, 2));
    for i in 0..N_OBSERVATIONS {
        design[[i, 1]] = (i % 2) as f64;
    }
    let x = Array2::from_shape_fn((N_OBSERVATIONS, n_features), |(i, j)| {
        let mu = (1.0 + j as f64 % 7.0) * if i % 2 == 0 { 5.0 } else { 9.0 };
        let lambda: f64 = Gamma::new(4.0, mu / 4.0).map_or(mu, |g| g.sample(&mut rng));
        Poisson::new(lambda.max(1e-12)).map_or(0.0, |p| p.sample(&mut rng))
    });
    let design_loc =
        DesignMatrix::new(design, vec!["intercept".to_string(), "treated".to_string()])
            .expect("valid design");
    FitData::new(x, design_loc, DesignMatrix::intercept(N_OBSERVATIONS)).expect("valid data")
}

fn benchmark_fit(c: &mut Criterion) {
    let datasets: Vec<_> = [10_usize, 100, 1000]
        .iter()
        .map(|&n| (n, simulated_counts(n)))
        .collect();

    let mut group = c.benchmark_group("batched_fit");
    group.sample_size(10);
    for (n_features, data) in datasets.iter() {
        group.throughput(Throughput::Elements(*n_features as u64));
        for strategy in [Strategy::NewtonRaphsonTrustRegion, Strategy::Irls] {
            let config = FitConfig {
                optimizer: strategy,
                ..FitConfig::default()
            };
            group.bench_with_input(
                BenchmarkId::new(strategy.name(), n_features),
                data,
                |b, input| {
                    b.iter(|| {
                        let result = fit_glm(black_box(input), &config).expect("fit succeeds");
                        black_box(result.loss);
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(fit_benchmark, benchmark_fit);
criterion_main!(fit_benchmark);
