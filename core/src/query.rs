//! Canonical query-string encoding.
//!
//! The same function builds the URL that is fetched and the fingerprint that
//! keys the cache, so two semantically equal queries always share a cache
//! entry.

use std::collections::BTreeMap;

/// A single query parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Str(String),
    /// Repeated parameter. `None` elements encode as a bare key.
    List(Vec<Option<String>>),
    /// `true` encodes as a bare key, `false` is omitted.
    Bool(bool),
    Null,
}

impl QueryValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            QueryValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue::Str(value.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        QueryValue::Str(value)
    }
}

impl From<bool> for QueryValue {
    fn from(value: bool) -> Self {
        QueryValue::Bool(value)
    }
}

impl From<Vec<String>> for QueryValue {
    fn from(value: Vec<String>) -> Self {
        QueryValue::List(value.into_iter().map(Some).collect())
    }
}

impl From<Vec<&str>> for QueryValue {
    fn from(value: Vec<&str>) -> Self {
        QueryValue::List(value.into_iter().map(|v| Some(v.to_string())).collect())
    }
}

/// Query parameters. Keys are kept sorted, which is the canonical order.
pub type Query = BTreeMap<String, QueryValue>;

/// Build a `Query` from key/value pairs.
///
/// ```
/// use swr_core::query::{canonicalize, query};
/// let q = query([("size", "10".into()), ("facets", true.into())]);
/// assert_eq!(canonicalize(&q), "facets&size=10");
/// ```
pub fn query<K, I>(pairs: I) -> Query
where
    K: Into<String>,
    I: IntoIterator<Item = (K, QueryValue)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Serialize `query` without the leading `?`.
pub fn canonicalize(query: &Query) -> String {
    let mut parts: Vec<String> = Vec::new();
    for (key, value) in query {
        match value {
            QueryValue::Null | QueryValue::Bool(false) => {}
            QueryValue::Bool(true) => parts.push(encode(key)),
            QueryValue::Str(s) if s.is_empty() => {}
            QueryValue::Str(s) => parts.push(format!("{}={}", encode(key), encode(s))),
            QueryValue::List(items) => {
                for item in items {
                    match item {
                        None => parts.push(encode(key)),
                        Some(v) => parts.push(format!("{}={}", encode(key), encode(v))),
                    }
                }
            }
        }
    }
    parts.join("&")
}

/// `url` joined with the canonical query, or `url` alone when the query
/// encodes to nothing.
pub fn full_url(url: &str, query: &Query) -> String {
    let qs = canonicalize(query);
    if qs.is_empty() {
        url.to_string()
    } else {
        format!("{url}?{qs}")
    }
}

/// URL for an action below `url`, e.g. `/records/1` + `publish`.
pub fn action_url(url: Option<&str>, action: Option<&str>, query: &Query) -> Option<String> {
    match (url, action) {
        (base, Some(action)) => {
            let path = match base {
                None => action.to_string(),
                Some(base) if base.ends_with('/') => format!("{base}{action}"),
                Some(base) => format!("{base}/{action}"),
            };
            Some(full_url(&path, query))
        }
        (Some(base), None) => Some(full_url(base, query)),
        (None, None) => None,
    }
}

/// Percent-encode a component. `! ' ( ) *` are escaped like every other
/// reserved character, `*` as lowercase `%2a`; commas stay literal.
fn encode(component: &str) -> String {
    urlencoding::encode(component)
        .replace("%2C", ",")
        .replace("%2A", "%2a")
}

/// Read an integer parameter, tolerating anything unparsable as absent.
pub fn int_param(query: &Query, key: &str) -> Option<i64> {
    query.get(key)?.as_str()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_sorted() {
        let q = query([("size", "10".into()), ("page", "1".into())]);
        assert_eq!(canonicalize(&q), "page=1&size=10");
    }

    #[test]
    fn booleans_and_nulls() {
        let q = query([
            ("facets", QueryValue::Bool(true)),
            ("hidden", QueryValue::Bool(false)),
            ("gone", QueryValue::Null),
            ("empty", QueryValue::Str(String::new())),
        ]);
        assert_eq!(canonicalize(&q), "facets");
    }

    #[test]
    fn lists_repeat_the_key() {
        let q = query([(
            "facets",
            QueryValue::List(vec![Some("type".into()), None, Some("lang".into())]),
        )]);
        assert_eq!(canonicalize(&q), "facets=type&facets&facets=lang");
    }

    #[test]
    fn reserved_characters_are_escaped_and_commas_kept() {
        let q = query([("q", "a b,(c)*!'".into())]);
        assert_eq!(canonicalize(&q), "q=a%20b,%28c%29%2a%21%27");
    }

    #[test]
    fn literal_percent_is_not_mistaken_for_an_escape() {
        let q = query([("q", "%2A%2C".into())]);
        assert_eq!(canonicalize(&q), "q=%252A%252C");
    }

    #[test]
    fn full_url_omits_question_mark_for_empty_query() {
        let q = query([("facets", QueryValue::Null)]);
        assert_eq!(full_url("/all/", &q), "/all/");
        let q = query([("page", "2".into())]);
        assert_eq!(full_url("/all/", &q), "/all/?page=2");
    }

    #[test]
    fn action_url_inserts_separator() {
        let q = Query::new();
        assert_eq!(action_url(Some("/r/1"), Some("publish"), &q).as_deref(), Some("/r/1/publish"));
        assert_eq!(action_url(Some("/r/1/"), Some("publish"), &q).as_deref(), Some("/r/1/publish"));
        assert_eq!(action_url(None, Some("publish"), &q).as_deref(), Some("publish"));
        assert_eq!(action_url(None, None, &q), None);
    }

    #[test]
    fn int_param_parses_strings_only() {
        let q = query([("page", "3".into()), ("size", QueryValue::Bool(true))]);
        assert_eq!(int_param(&q, "page"), Some(3));
        assert_eq!(int_param(&q, "size"), None);
        assert_eq!(int_param(&q, "missing"), None);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn value_strategy() -> impl Strategy<Value = QueryValue> {
        prop_oneof![
            "[a-z0-9 ,()*!']{0,8}".prop_map(QueryValue::Str),
            any::<bool>().prop_map(QueryValue::Bool),
            Just(QueryValue::Null),
            prop::collection::vec(prop::option::of("[a-z0-9]{1,4}"), 0..4).prop_map(QueryValue::List),
        ]
    }

    /// Bare keys come back with an empty value; generated values are never
    /// empty, so empty maps back to `None`.
    fn decode_pairs(qs: &str) -> Vec<(String, Option<String>)> {
        url::form_urlencoded::parse(qs.as_bytes())
            .map(|(k, v)| (k.into_owned(), Some(v.into_owned()).filter(|v| !v.is_empty())))
            .collect()
    }

    proptest! {
        /// Insertion order never reaches the output.
        #[test]
        fn prop_insertion_order_irrelevant(
            entries in prop::collection::btree_map("[a-z]{1,5}", value_strategy(), 0..6),
        ) {
            let mut forward = Query::new();
            for (k, v) in entries.iter() {
                forward.insert(k.clone(), v.clone());
            }
            let mut backward = Query::new();
            for (k, v) in entries.iter().rev() {
                backward.insert(k.clone(), v.clone());
            }
            prop_assert_eq!(canonicalize(&forward), canonicalize(&backward));
        }

        /// Decoding the output yields the key/value pairs the encoding rules
        /// promise.
        #[test]
        fn prop_output_parses_back(
            entries in prop::collection::btree_map("[a-z]{1,5}", value_strategy(), 0..6),
        ) {
            let q: Query = entries;
            let mut expected: Vec<(String, Option<String>)> = Vec::new();
            for (k, v) in &q {
                match v {
                    QueryValue::Bool(true) => expected.push((k.clone(), None)),
                    QueryValue::Str(s) if !s.is_empty() => expected.push((k.clone(), Some(s.clone()))),
                    QueryValue::List(items) => {
                        for item in items {
                            expected.push((k.clone(), item.clone()));
                        }
                    }
                    _ => {}
                }
            }
            prop_assert_eq!(decode_pairs(&canonicalize(&q)), expected);
        }
    }
}
