pub mod fetcher;
pub mod probe;

#[cfg(test)]
mod testutil;

pub use fetcher::RoutedFetcher;
pub use probe::{ReqwestProbe, client_for};
