//! Share URI Parsing
//!
//! Turns `ss://` share links into a [`ServerConfiguration`]. Two layouts are
//! accepted:
//!
//! - SIP002: `ss://base64(method:password)@host:port[/?plugin=...][#tag]`
//! - Legacy: `ss://base64(method:password@host:port)[#tag]`
//!
//! Base64 bodies must be standard-alphabet with canonical padding.

use crate::config::{Method, ServerConfiguration};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;
use url::form_urlencoded;

const SCHEME: &str = "ss://";

/// Share URI errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("Not an ss:// URI")]
    UnsupportedScheme,

    #[error("Invalid base64 payload")]
    InvalidBase64,

    #[error("Malformed URI: {0}")]
    Malformed(&'static str),

    #[error("Unsupported cipher method: {0}")]
    UnsupportedMethod(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

/// Parse a share URI, SIP002 first, then the legacy layout
pub fn parse(uri: &str) -> Result<ServerConfiguration, UriError> {
    parse_sip002(uri).or_else(|sip002_err| {
        parse_legacy(uri).map_err(|legacy_err| match legacy_err {
            // Report the SIP002 failure when the body was never legacy-shaped
            UriError::InvalidBase64 if uri.contains('@') => sip002_err,
            other => other,
        })
    })
}

/// `ss://base64(method:password)@host:port[/?query][#tag]`
pub fn parse_sip002(uri: &str) -> Result<ServerConfiguration, UriError> {
    let (body, tag) = split_tag(strip_scheme(uri)?)?;

    let (rest, query) = match body.split_once('?') {
        Some((rest, query)) => (rest, Some(query)),
        None => (body, None),
    };
    let rest = rest.strip_suffix('/').unwrap_or(rest);

    let (user_info, authority) = rest
        .rsplit_once('@')
        .ok_or(UriError::Malformed("missing user info"))?;
    let user_info = percent_decode(user_info)?;
    let credentials = decode_base64(&user_info)?;
    let (method, password) = credentials
        .split_once(':')
        .ok_or(UriError::Malformed("missing method separator"))?;

    let (host, port) = split_host_port(authority)?;

    let extra: BTreeMap<String, String> = query
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    build(host, port, method, password, tag, extra)
}

/// `ss://base64(method:password@host:port)[#tag]`
pub fn parse_legacy(uri: &str) -> Result<ServerConfiguration, UriError> {
    let (body, tag) = split_tag(strip_scheme(uri)?)?;
    let decoded = decode_base64(body)?;

    let (method, rest) = decoded
        .split_once(':')
        .ok_or(UriError::Malformed("missing method separator"))?;
    let (password, authority) = rest
        .rsplit_once('@')
        .ok_or(UriError::Malformed("missing host"))?;
    let (host, port) = split_host_port(authority)?;

    build(host, port, method, password, tag, BTreeMap::new())
}

fn strip_scheme(uri: &str) -> Result<&str, UriError> {
    uri.trim().strip_prefix(SCHEME).ok_or(UriError::UnsupportedScheme)
}

/// Split off and percent-decode the `#tag` fragment
fn split_tag(body: &str) -> Result<(&str, Option<String>), UriError> {
    match body.split_once('#') {
        Some((body, tag)) => Ok((body, Some(percent_decode(tag)?).filter(|t| !t.is_empty()))),
        None => Ok((body, None)),
    }
}

fn percent_decode(input: &str) -> Result<String, UriError> {
    percent_decode_str(input)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| UriError::Malformed("invalid percent encoding"))
}

fn decode_base64(input: &str) -> Result<String, UriError> {
    let bytes = STANDARD.decode(input).map_err(|_| UriError::InvalidBase64)?;
    String::from_utf8(bytes).map_err(|_| UriError::InvalidBase64)
}

fn split_host_port(authority: &str) -> Result<(&str, u16), UriError> {
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or(UriError::Malformed("missing port"))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(UriError::Malformed("missing host"));
    }

    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(UriError::InvalidPort(port.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| UriError::InvalidPort(port.to_string()))?;

    Ok((host, port))
}

fn build(
    host: &str,
    port: u16,
    method: &str,
    password: &str,
    tag: Option<String>,
    extra: BTreeMap<String, String>,
) -> Result<ServerConfiguration, UriError> {
    let method: Method = method
        .parse()
        .map_err(|_| UriError::UnsupportedMethod(method.to_string()))?;
    if password.is_empty() {
        return Err(UriError::Malformed("empty password"));
    }

    let mut config = ServerConfiguration::new(host, port, method, password);
    config.tag = tag;
    config.extra = extra;
    Ok(config)
}
