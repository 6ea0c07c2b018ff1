mod api;
mod fetcher;
mod scrape;

pub use fetcher::{GithubEndpoints, GithubFetcher};
