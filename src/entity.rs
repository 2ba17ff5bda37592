//! Content negotiation and captured message bodies.
//!
//! Bodies are encoded and decoded by MIME type: JSON, URL-encoded forms and
//! plain text are understood. MIME parameters such as `charset` are ignored
//! when choosing a codec.

use std::fmt::{self, Write as _};

use reqwest::{header, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use crate::{ApiError, Result};

pub const JSON: &str = "application/json";
pub const URL_ENCODED: &str = "application/x-www-form-urlencoded";
pub const PLAIN_TEXT: &str = "text/plain";

const HEXDUMP_WIDTH: usize = 20;

/// A message body snapshot with its content type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entity {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Entity {
    pub fn new(content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Reads the whole body of `response`, consuming it.
    pub async fn capture(response: reqwest::Response) -> std::result::Result<Self, reqwest::Error> {
        let content_type = content_type_of(response.headers());
        let data = response.bytes().await?;
        Ok(Self::new(content_type, data.to_vec()))
    }

    pub fn is_binary(&self) -> bool {
        is_binary_mimetype(&self.content_type)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "---")?;
        writeln!(
            f,
            "{} ({})",
            self.content_type,
            human_bytes(self.data.len() as u64)
        )?;
        writeln!(f, "---")?;
        if self.is_binary() {
            f.write_str(&hexdump(&self.data, HEXDUMP_WIDTH))?;
        } else {
            writeln!(f, "{}", String::from_utf8_lossy(&self.data))?;
        }
        f.write_str("#")
    }
}

/// Encodes `entity` for `content_type`.
pub fn marshal<T>(content_type: &str, entity: &T) -> Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    match media_type(content_type).as_str() {
        JSON => serde_json::to_vec(entity).map_err(|err| ApiError::Marshal(err.to_string())),
        URL_ENCODED => serde_urlencoded::to_string(entity)
            .map(String::into_bytes)
            .map_err(|err| ApiError::Marshal(err.to_string())),
        PLAIN_TEXT => {
            let value =
                serde_json::to_value(entity).map_err(|err| ApiError::Marshal(err.to_string()))?;
            match value {
                serde_json::Value::String(text) => Ok(text.into_bytes()),
                serde_json::Value::Number(_) | serde_json::Value::Bool(_) => {
                    Ok(value.to_string().into_bytes())
                }
                _ => Err(ApiError::Marshal(
                    "only scalar values can be sent as text/plain".to_owned(),
                )),
            }
        }
        _ => Err(ApiError::UnsupportedMimetype(content_type.to_owned())),
    }
}

/// Decodes `data` of the given `content_type`.
///
/// Plain text is read as a JSON scalar when it parses as one (so numbers and
/// booleans decode into numeric and boolean types), otherwise as a string.
pub fn unmarshal<T>(content_type: &str, data: &[u8]) -> Result<T>
where
    T: DeserializeOwned,
{
    match media_type(content_type).as_str() {
        JSON => serde_json::from_slice(data).map_err(|err| ApiError::Unmarshal(err.to_string())),
        URL_ENCODED => {
            serde_urlencoded::from_bytes(data).map_err(|err| ApiError::Unmarshal(err.to_string()))
        }
        PLAIN_TEXT => {
            let text = std::str::from_utf8(data)
                .map_err(|err| ApiError::Unmarshal(format!("text/plain body is not utf-8: {err}")))?;
            serde_json::from_str(text.trim()).or_else(|_| {
                serde_json::from_value(serde_json::Value::String(text.to_owned()))
                    .map_err(|err| ApiError::Unmarshal(err.to_string()))
            })
        }
        _ => Err(ApiError::UnsupportedMimetype(content_type.to_owned())),
    }
}

/// Decodes the body of `response` by its `Content-Type`, consuming it.
///
/// `204 No Content` decodes as JSON `null`, so `Option<T>` and `()` receive
/// an empty value.
pub async fn from_response<T>(response: reqwest::Response) -> Result<T>
where
    T: DeserializeOwned,
{
    if response.status() == StatusCode::NO_CONTENT {
        return serde_json::from_value(serde_json::Value::Null)
            .map_err(|err| ApiError::Unmarshal(err.to_string()));
    }
    let entity = Entity::capture(response)
        .await
        .map_err(ApiError::Transport)?;
    unmarshal(&entity.content_type, &entity.data)
}

pub(crate) fn content_type_of(headers: &header::HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_binary_mimetype(content_type: &str) -> bool {
    let media = media_type(content_type);
    if media.is_empty() {
        return true;
    }
    if media == JSON || media.starts_with("text/") {
        return false;
    }
    let has_charset = content_type.split(';').skip(1).any(|param| {
        param
            .split('=')
            .next()
            .is_some_and(|name| name.trim().eq_ignore_ascii_case("charset"))
    });
    !has_charset
}

pub(crate) fn human_bytes(size: u64) -> String {
    const UNITS: [&str; 6] = ["kB", "MB", "GB", "TB", "PB", "EB"];
    if size < 1000 {
        return format!("{size} B");
    }
    let mut value = size as f64 / 1000.0;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if value < 10.0 {
        format!("{value:.1} {}", UNITS[unit])
    } else {
        format!("{value:.0} {}", UNITS[unit])
    }
}

fn hexdump(data: &[u8], width: usize) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(width).enumerate() {
        let _ = write!(out, "{:08x}  ", line * width);
        for index in 0..width {
            match chunk.get(index) {
                Some(byte) => {
                    let _ = write!(out, "{byte:02x} ");
                }
                None => out.push_str("   "),
            }
        }
        out.push_str(" |");
        out.extend(chunk.iter().map(|&byte| {
            if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}
