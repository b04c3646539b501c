pub mod sphere;
pub mod tan;
