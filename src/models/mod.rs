pub mod detection;
pub mod event;
pub mod upload;
pub mod watchlist;
