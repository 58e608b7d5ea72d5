pub mod dispatcher;
pub mod error;
pub mod limiter;
pub mod probe;
pub mod queue;
pub mod sweep;
pub mod worker;

#[cfg(test)]
mod test_utils;
