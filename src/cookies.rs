use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const DEFAULT_EXPIRATION_HOURS: i64 = 24;
const NETSCAPE_HEADER: &str = "# Netscape HTTP Cookie File";
const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("cookie file {} could not be read: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("expected a JSON array of cookies ({0})")]
    InvalidOverride(#[from] serde_json::Error),
    #[error("cookie at position {0} has an empty name")]
    EmptyName(usize),
    #[error("cookie {0:?} contains a tab or line break")]
    InvalidField(String),
}

/// One line of a cookie export, before defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCookieRecord {
    pub domain: String,
    pub host_only: bool,
    pub path: String,
    pub secure: bool,
    pub expiration: Option<i64>,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameSite {
    #[default]
    NoRestriction,
    Lax,
    Strict,
    Unspecified,
}

/// A cookie as handed to the upstream session.
///
/// Serializes to the JSON shape browser cookie extensions use, which is also
/// the shape accepted in the `cookies` query parameter. Only `name` and
/// `value` are required there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCookie {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default)]
    pub host_only: bool,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_secure")]
    pub secure: bool,
    #[serde(default = "default_expiration", deserialize_with = "expiration_seconds")]
    pub expiration_date: i64,
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default, deserialize_with = "same_site_or_default")]
    pub same_site: SameSite,
    #[serde(default)]
    pub session: bool,
}

impl SessionCookie {
    pub fn from_record(record: RawCookieRecord, now: i64) -> Self {
        Self {
            domain: record.domain,
            host_only: record.host_only,
            path: record.path,
            secure: record.secure,
            expiration_date: record
                .expiration
                .unwrap_or_else(|| now + Duration::hours(DEFAULT_EXPIRATION_HOURS).num_seconds()),
            name: record.name,
            value: record.value,
            http_only: false,
            same_site: SameSite::NoRestriction,
            session: false,
        }
    }
}

fn default_domain() -> String {
    ".youtube.com".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_secure() -> bool {
    true
}

fn default_expiration() -> i64 {
    (Utc::now() + Duration::hours(DEFAULT_EXPIRATION_HOURS)).timestamp()
}

// Chrome reports expirationDate as fractional seconds.
fn expiration_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?
        .map(|seconds| seconds.trunc() as i64)
        .unwrap_or_else(default_expiration))
}

fn same_site_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SameSite, D::Error> {
    Ok(Option::<SameSite>::deserialize(deserializer)?.unwrap_or_default())
}

pub fn parse_cookie_line(line: &str) -> Option<RawCookieRecord> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() || line.starts_with('#') {
        return None;
    }

    // domain \t host_only \t path \t secure \t expiration \t name \t value
    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() < 7 {
        return None;
    }

    Some(RawCookieRecord {
        domain: parts[0].to_string(),
        host_only: parts[1] == "TRUE",
        path: parts[2].to_string(),
        secure: parts[3] == "TRUE",
        expiration: parts[4].trim().parse::<i64>().ok(),
        name: parts[5].to_string(),
        value: parts[6].to_string(),
    })
}

pub fn parse_cookies(contents: &str, now: i64) -> Vec<SessionCookie> {
    contents
        .lines()
        .filter_map(parse_cookie_line)
        .map(|record| SessionCookie::from_record(record, now))
        .collect()
}

/// Reads a cookie export. A missing file is an empty cookie set.
pub async fn read_cookie_file(path: &Path) -> Result<Vec<SessionCookie>, CookieError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(parse_cookies(&contents, Utc::now().timestamp())),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(CookieError::Unreadable {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Loads the startup cookie set, falling back to no cookies on any failure.
pub async fn load_cookies(path: &Path) -> Vec<SessionCookie> {
    match read_cookie_file(path).await {
        Ok(cookies) => {
            if cookies.is_empty() {
                info!("No cookies loaded from {:?}, proceeding without cookies", path);
            } else {
                info!("Loaded {} cookie(s) from {:?}", cookies.len(), path);
            }
            cookies
        }
        Err(error) => {
            warn!("{error}. Proceeding without cookies.");
            Vec::new()
        }
    }
}

/// Parses the per-request `cookies` parameter. An empty array is no override.
pub fn parse_cookie_override(raw: &str) -> Result<Option<Vec<SessionCookie>>, CookieError> {
    let cookies: Vec<SessionCookie> = serde_json::from_str(raw)?;
    if let Some(position) = cookies
        .iter()
        .position(|cookie| cookie.name.trim().is_empty())
    {
        return Err(CookieError::EmptyName(position));
    }

    Ok((!cookies.is_empty()).then_some(cookies))
}

/// Writes cookies in Netscape format.
///
/// The "include subdomains" column follows the leading dot of the domain,
/// which is what cookie jar readers check it against.
pub fn to_netscape(cookies: &[SessionCookie]) -> Result<String, CookieError> {
    let mut lines = vec![NETSCAPE_HEADER.to_string(), String::new()];

    for cookie in cookies {
        let fields = [&cookie.domain, &cookie.path, &cookie.name, &cookie.value];
        if fields
            .iter()
            .any(|field| field.contains(['\t', '\n', '\r']))
        {
            return Err(CookieError::InvalidField(cookie.name.clone()));
        }

        let prefix = if cookie.http_only { HTTP_ONLY_PREFIX } else { "" };
        lines.push(format!(
            "{prefix}{}\t{}\t{}\t{}\t{}\t{}\t{}",
            cookie.domain,
            netscape_flag(cookie.domain.starts_with('.')),
            cookie.path,
            netscape_flag(cookie.secure),
            cookie.expiration_date,
            cookie.name,
            cookie.value
        ));
    }

    let mut output = lines.join("\n");
    output.push('\n');
    Ok(output)
}

fn netscape_flag(value: bool) -> &'static str {
    if value { "TRUE" } else { "FALSE" }
}
