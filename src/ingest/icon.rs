// src/ingest/icon.rs
//! Icon selection: configured icon → feed image → favicon service, always
//! served through the local icon proxy.

use url::Url;

pub const ICON_PROXY_PREFIX: &str = "/api/icon?url=";

/// Favicon lookup URL for the feed's host, if the URL has one.
pub fn favicon_url(feed_url: &str) -> Option<String> {
    let parsed = Url::parse(feed_url).ok()?;
    let host = parsed.host_str()?;
    Some(format!(
        "https://www.google.com/s2/favicons?domain={host}&sz=64"
    ))
}

/// Rewrite through the proxy; already-proxied and empty values are left alone.
pub fn proxy_icon_url(icon: &str) -> String {
    if icon.is_empty() || icon.starts_with(ICON_PROXY_PREFIX) {
        return icon.to_string();
    }
    let encoded: String = url::form_urlencoded::byte_serialize(icon.as_bytes()).collect();
    format!("{ICON_PROXY_PREFIX}{encoded}")
}

pub fn resolve_icon(configured: &str, feed_image: Option<&str>, feed_url: &str) -> String {
    let chosen = Some(configured.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| {
            feed_image
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .or_else(|| favicon_url(feed_url))
        .unwrap_or_default();
    proxy_icon_url(&chosen)
}
