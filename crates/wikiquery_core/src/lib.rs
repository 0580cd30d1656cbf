//! Request, continuation and cache engine for the MediaWiki action API.

pub mod cache;
pub mod classify;
pub mod config;
pub mod cookies;
pub mod cursor;
pub mod error;
pub mod params;
pub mod request;
pub mod site;
pub mod throttle;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheEntry, PurgeReport, ResponseCache};
pub use config::{EngineConfig, load_config};
pub use cursor::QueryCursor;
pub use error::{ApiError, Error, Result};
pub use params::{OptionSet, ParamValue, ParameterSet};
pub use request::{Request, RequestState, TransportHint, WarningVerdict};
pub use site::{AuthClass, ModuleInfo, Site, SiteIdentity};
