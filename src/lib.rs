#![doc = include_str!("../README.md")]

pub mod database;
pub mod logger;
pub mod util;

#[cfg(test)]
pub mod test_support;
