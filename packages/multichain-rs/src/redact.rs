//! Redaction of key material in logs and `Debug` output.
//!
//! Relayer keys are wrapped in [`Redacted`] as soon as they are read from disk.
//! The inner value is reachable only through [`Redacted::expose`].
//! Endpoint URLs go through [`redact_url`] before they are logged.

use std::fmt::{self, Debug, Display};
use url::Url;

/// Wrapper that prints `"<redacted>"` instead of its inner value.
///
/// ```ignore
/// use multichain_rs::redact::Redacted;
///
/// let key = Redacted(vec![1u8, 2, 3]);
/// tracing::info!(key = %key, "Loaded key");
/// // Logs: key = <redacted>
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Redacted<T>(pub T);

impl<T> Redacted<T> {
    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> serde::Serialize for Redacted<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        "<redacted>".serialize(serializer)
    }
}

/// Scheme, host and port of `raw`; credentials, path and query are masked.
///
/// Gateway and gas-station URLs often carry an API key in the userinfo, the
/// path (`/v3/<key>`) or the query (`?apikey=`).
pub fn redact_url(raw: &str) -> String {
    let Ok(url) = Url::parse(raw) else {
        return "<redacted>".to_string();
    };
    let Some(host) = url.host_str() else {
        return "<redacted>".to_string();
    };

    let mut out = format!("{}://", url.scheme());
    if !url.username().is_empty() || url.password().is_some() {
        out.push_str("<redacted>@");
    }
    out.push_str(host);
    if let Some(port) = url.port() {
        out.push_str(&format!(":{}", port));
    }
    if url.path() != "/" || url.query().is_some() {
        out.push_str("/<redacted>");
    }
    out
}
