// Wire codecs: frame layer, admission packets, command payloads

pub mod frame;
pub mod identity;
pub mod payload;
