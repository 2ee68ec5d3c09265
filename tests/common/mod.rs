use nbglm::DesignMatrix;
use ndarray::{Array1, Array2, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Gamma, Normal, Poisson};

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Gamma-Poisson draws: one column per feature, observation means `mu`,
/// dispersion (size) `r`.
pub fn simulate_nb(
    rng: &mut StdRng,
    mu: ArrayView1<f64>,
    r: f64,
    n_features: usize,
) -> Array2<f64> {
    let mut x = Array2::zeros((mu.len(), n_features));
    for ((i, _), value) in x.indexed_iter_mut() {
        let gamma = Gamma::new(r, mu[i] / r).unwrap();
        let lambda: f64 = gamma.sample(rng);
        let poisson = Poisson::new(lambda.max(1e-12)).unwrap();
        let count: f64 = poisson.sample(rng);
        *value = count;
    }
    x
}

/// Poisson draws with a shared rate, i.e. counts without overdispersion.
pub fn simulate_poisson(
    rng: &mut StdRng,
    rate: f64,
    n_obs: usize,
    n_features: usize,
) -> Array2<f64> {
    let poisson = Poisson::new(rate).unwrap();
    Array2::from_shape_simple_fn((n_obs, n_features), || poisson.sample(rng))
}

/// Normal draws with observation means `mean` and a shared standard deviation.
pub fn simulate_normal(
    rng: &mut StdRng,
    mean: ArrayView1<f64>,
    sd: f64,
    n_features: usize,
) -> Array2<f64> {
    let noise = Normal::new(0.0, sd).unwrap();
    let mut x = Array2::zeros((mean.len(), n_features));
    for ((i, _), value) in x.indexed_iter_mut() {
        *value = mean[i] + noise.sample(rng);
    }
    x
}

/// Alternating condition labels, first observation in the reference group.
pub fn condition(n_obs: usize) -> Array1<f64> {
    Array1::from_iter((0..n_obs).map(|i| (i % 2) as f64))
}

/// Intercept plus a treatment indicator.
pub fn two_group_design(n_obs: usize) -> DesignMatrix {
    let treated = condition(n_obs);
    let mut values = Array2::ones((n_obs, 2));
    values.column_mut(1).assign(&treated);
    DesignMatrix::new(values, vec!["intercept".to_string(), "treated".to_string()]).unwrap()
}

/// Column means of the rows where `mask` holds.
pub fn group_means(x: &Array2<f64>, mask: impl Fn(usize) -> bool) -> Array1<f64> {
    let rows: Vec<usize> = (0..x.nrows()).filter(|&i| mask(i)).collect();
    let mut sums = Array1::zeros(x.ncols());
    for &i in &rows {
        sums += &x.row(i);
    }
    sums / rows.len() as f64
}
