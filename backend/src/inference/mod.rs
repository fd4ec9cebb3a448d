pub mod model;
pub mod preprocess;
