pub mod merger;
pub mod staging;
