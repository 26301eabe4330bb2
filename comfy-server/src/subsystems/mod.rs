pub mod relay;
pub mod resolver;
