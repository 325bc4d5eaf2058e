//! URL and query-string decoding for `handle_params`.

use std::borrow::Cow;

use serde_json::{Map, Value};
use url::{form_urlencoded, ParseError, Url};

/// Parameters handed to `mount` and `handle_params`.
pub type Params = Map<String, Value>;

/// Origin that relative join URLs (`/users?page=2`) are resolved against.
const LOCAL_ORIGIN: &str = "http://localhost/";

/// Parse an absolute URL, or a relative one against the local origin.
pub fn parse_url(url: &str) -> Result<Url, ParseError> {
    match Url::parse(url) {
        Err(ParseError::RelativeUrlWithoutBase) => Url::parse(LOCAL_ORIGIN)?.join(url),
        parsed => parsed,
    }
}

/// Path of a URL: `http://host:4000/users?page=2#top` gives `/users`.
pub fn url_path(url: &str) -> Result<String, ParseError> {
    Ok(parse_url(url)?.path().to_string())
}

/// Decode an `application/x-www-form-urlencoded` body such as
/// `a=1&b=x+y&tags[]=p&tags[]=q` into a parameter map.
pub fn parse_query(query: &str) -> Params {
    collect_pairs(form_urlencoded::parse(query.as_bytes()))
}

/// Query parameters of a URL.
pub fn url_params(url: &str) -> Result<Params, ParseError> {
    Ok(collect_pairs(parse_url(url)?.query_pairs()))
}

/// Repeated keys keep the last value, except keys ending in `[]` which
/// collect into an array.
fn collect_pairs<'a>(pairs: impl Iterator<Item = (Cow<'a, str>, Cow<'a, str>)>) -> Params {
    let mut params = Params::new();
    for (key, value) in pairs {
        let value = Value::String(value.into_owned());
        match key.strip_suffix("[]") {
            Some(list_key) => {
                let entry = params
                    .entry(list_key.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                match entry {
                    Value::Array(items) => items.push(value),
                    other => *other = Value::Array(vec![value]),
                }
            }
            None => {
                params.insert(key.into_owned(), value);
            }
        }
    }
    params
}
