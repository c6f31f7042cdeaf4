//! Website scraping for the Scrape stage.
//!
//! This crate provides:
//! - [`session`]: heavyweight browser sessions and the factory that builds them
//! - [`engine`]: the [`Scraper`] trait and the breadth-first [`HttpScraper`]
//! - [`extract`]: visible text, same-domain e-mail, and link extraction

pub mod engine;
pub mod extract;
pub mod session;

pub use engine::{HttpScraper, ScrapeConfig, Scraper};
pub use extract::{compute_hash, extract_emails, extract_links, extract_text};
pub use session::{BrowserSession, HttpSessionFactory, SessionSettings};
