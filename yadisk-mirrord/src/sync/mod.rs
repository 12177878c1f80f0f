pub mod backoff;
pub mod index;
pub mod key;
pub mod ledger;
pub mod paths;
pub mod reconcile;
pub mod schedule;
pub mod transfer;

#[cfg(test)]
pub(crate) mod test_support;
