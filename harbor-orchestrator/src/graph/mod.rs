pub mod resolver;

pub use resolver::{GraphResolver, Layer};
