pub mod events;
pub mod notifier;
pub mod processor;
pub mod queue;
pub mod storage;
pub mod watchlist;
