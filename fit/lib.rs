#![warn(dead_code)]
#![warn(unused_imports)]

pub mod bounds;
pub mod constraints;
pub mod convergence;
pub mod data;
pub mod derivatives;
pub mod estimate;
pub mod faer_ndarray;
pub mod init;
pub mod likelihood;
pub mod model;
pub mod optimizer;
pub mod progress;
pub mod session;
pub mod special;
pub mod variables;

pub use data::{DesignMatrix, FitData};
pub use estimate::{EstimationError, FitHooks, FitResult, fit_glm, fit_glm_with};
pub use init::{ClosedFormInitializer, InitialParameters, Initializer};
pub use model::{Family, FitConfig, ScaleLink};
pub use optimizer::{FirstOrderRule, Strategy};
pub use session::{FitSnapshot, StopHandle, StopReason};
