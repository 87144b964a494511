//! Cross-crate scenarios: clients running against the mock media driver.

#[cfg(test)]
mod harness;

#[cfg(test)]
mod end_to_end;

#[cfg(test)]
mod concurrency;
