pub mod priority_2d;

pub use priority_2d::*;
