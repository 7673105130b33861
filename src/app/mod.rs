mod announcements;
mod browser;
mod cache;
mod config;
mod crawler;
mod data_io;
mod download;
mod error;
mod parser;
mod pool;
mod portal;
mod reconcile;
mod runtime;
mod serializer;
mod session;
mod store;
#[cfg(test)]
mod testing;
mod types;
mod webdriver;

pub use runtime::run;
