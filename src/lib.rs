//! tickbar library exports

pub mod core;
pub mod input;
pub mod output;

#[cfg(test)]
pub mod test_support;
