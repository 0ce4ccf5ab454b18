//! Query-string parsing for callback URLs.
//!
//! Keys and values are normalized to lowercase, keys lose any leading `?`
//! and surrounding spaces, and values are percent-decoded. A segment that
//! does not split into exactly one key and one value keeps its key with an
//! empty value.

use url::Url;

use crate::error::{Error, Result};

/// Ordered query parameters.
///
/// A repeated key stays as separate entries (`?tag=a&tag=b` has length 2)
/// rather than being joined into one comma-separated value; use
/// [`get_all`](Self::get_all) to collect them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// First value for `key` (matched case-insensitively).
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_lowercase();
        self.pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        let key = key.to_lowercase();
        self.pairs
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Value at position `index` in the original order.
    pub fn value_at(&self, index: usize) -> Option<&str> {
        self.pairs.get(index).map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Parse the query string of an absolute URL.
pub fn parse_query_string(url: &str) -> Result<QueryParams> {
    let url = Url::parse(url).map_err(|e| Error::Other(format!("invalid url {url}: {e}")))?;

    let Some(query) = url.query().filter(|q| !q.is_empty()) else {
        return Ok(QueryParams::default());
    };

    let pairs = query
        .split('&')
        .map(|segment| {
            let parts: Vec<&str> = segment.split('=').collect();
            let key = parts[0]
                .trim_matches(|c| c == '?' || c == ' ')
                .to_lowercase();
            let value = if parts.len() == 2 {
                decode(&parts[1].trim().to_lowercase())
            } else {
                String::new()
            };
            (key, value)
        })
        .collect();

    Ok(QueryParams { pairs })
}

fn decode(value: &str) -> String {
    url::form_urlencoded::parse(format!("v={value}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}
