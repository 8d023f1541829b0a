/// Scales the median absolute deviation to a standard deviation under normality.
pub const MAD_SCALE: f64 = 1.4826;

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_OUTLIER_K: f64 = 3.0;
pub const DEFAULT_SKETCH_BUDGET: usize = 5000;
pub const DEFAULT_SKETCH_RANK: usize = 50;
pub const DEFAULT_MIX_ALPHA: f64 = 0.1;
pub const DEFAULT_INTEGRATION_DIMS: usize = 30;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_N_FEATURES: usize = 2000;
pub const DEFAULT_MAX_ITERATIONS: usize = 100;
pub const DEFAULT_TOLERANCE: f64 = 1e-6;
pub const DEFAULT_OVERSAMPLING: usize = 10;
pub const DEFAULT_CONSISTENCY_TOLERANCE: f64 = 1e-6;
pub const DEFAULT_SCALE_FACTOR: f64 = 10_000.0;
pub const DEFAULT_THETA: f64 = 100.0;
pub const DEFAULT_NEIGHBORS: usize = 15;

/// Problems up to this dimension are decomposed densely instead of iteratively.
pub const DENSE_EIGEN_THRESHOLD: usize = 1024;

/// Eigenvalues below this fraction of the largest one are treated as zero.
pub const EIGENVALUE_EPSILON: f64 = 1e-10;

pub const DEFAULT_MITO_PREFIXES: &[&str] = &["MT-", "mt-"];
