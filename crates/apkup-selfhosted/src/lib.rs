mod dto;
mod fetcher;

pub use fetcher::SelfHostedFetcher;
