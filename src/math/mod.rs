pub mod fixed;
pub mod wide;

pub use fixed::Fixed64;
pub use wide::mul_div;
