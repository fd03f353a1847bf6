//! Click analytics: client address extraction, country lookup and the
//! background recorder that feeds the time-series store and the click log.

pub mod geoip;
pub mod ip_extractor;
pub mod recorder;

pub use geoip::GeoIpService;
pub use ip_extractor::{extract_client_ip, is_public_ipv4};
pub use recorder::{headers_map, Click, ClickRecorder};
