use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use url::form_urlencoded;

use crate::error::{Error, Result};
use crate::site::SiteIdentity;

/// Parameter names ending with this suffix are sent after all other parameters.
pub const TOKEN_SUFFIX: &str = "token";
/// Sent after every other parameter, including other tokens.
pub const LAST_TOKEN: &str = "wpEditToken";

const MULTI_VALUE_SEPARATOR: &str = "|";
const ALTERNATIVE_SEPARATOR: &str = "\u{1f}";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Character encoding a site declares for request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SiteEncoding {
    #[default]
    Utf8,
    Latin1,
}

impl SiteEncoding {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Self::Utf8),
            "iso-8859-1" | "latin-1" | "latin1" => Some(Self::Latin1),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Latin1 => "iso-8859-1",
        }
    }

    /// Returns `None` when `value` has characters the encoding cannot represent.
    pub fn encode(self, value: &str) -> Option<Vec<u8>> {
        match self {
            Self::Utf8 => Some(value.as_bytes().to_vec()),
            Self::Latin1 => value
                .chars()
                .map(|ch| u8::try_from(u32::from(ch)).ok())
                .collect(),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|byte| char::from(*byte)).collect(),
        }
    }
}

/// Enable/disable option bag, sent as `name` or `!name` items.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OptionSet {
    entries: Vec<(String, bool)>,
    allowed: Option<BTreeSet<String>>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the option names this set accepts.
    pub fn with_allowed<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: Vec::new(),
            allowed: Some(names.into_iter().map(Into::into).collect()),
        }
    }

    /// Parse the wire form, e.g. `minor|!bot`.
    pub fn parse(value: &str) -> Result<Self> {
        let mut set = Self::new();
        for item in value.split(MULTI_VALUE_SEPARATOR).filter(|item| !item.is_empty()) {
            match item.strip_prefix('!') {
                Some(name) => set.disable(name)?,
                None => set.enable(item)?,
            }
        }
        Ok(set)
    }

    pub fn enable(&mut self, name: &str) -> Result<()> {
        self.set(name, true)
    }

    pub fn disable(&mut self, name: &str) -> Result<()> {
        self.set(name, false)
    }

    pub fn set(&mut self, name: &str, enabled: bool) -> Result<()> {
        if let Some(allowed) = &self.allowed
            && !allowed.contains(name)
        {
            return Err(Error::Misuse(format!("unknown option '{name}'")));
        }
        match self.entries.iter_mut().find(|(existing, _)| existing == name) {
            Some(entry) => entry.1 = enabled,
            None => self.entries.push((name.to_string(), enabled)),
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<bool> {
        let index = self.entries.iter().position(|(existing, _)| existing == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, enabled)| *enabled)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn api_iter(&self) -> impl Iterator<Item = String> + '_ {
        self.entries.iter().map(|(name, enabled)| {
            if *enabled {
                name.clone()
            } else {
                format!("!{name}")
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    List(Vec<String>),
    /// `true` is sent as an empty value, `false` omits the parameter.
    Flag(bool),
    Options(OptionSet),
}

impl ParamValue {
    fn wire_items(&self) -> Option<Vec<String>> {
        match self {
            Self::List(values) if values.is_empty() => None,
            Self::List(values) => Some(values.clone()),
            Self::Flag(true) => Some(vec![String::new()]),
            Self::Flag(false) => None,
            Self::Options(options) if options.is_empty() => None,
            Self::Options(options) => Some(options.api_iter().collect()),
        }
    }
}

/// Conversion into a parameter value.
///
/// Strings are split on `|`, sequences keep one item per element,
/// timestamps render as ISO 8601 and `None` omits the parameter.
pub trait IntoParamValue {
    fn into_param_value(self) -> ParamValue;
}

impl IntoParamValue for ParamValue {
    fn into_param_value(self) -> ParamValue {
        self
    }
}

impl IntoParamValue for &str {
    fn into_param_value(self) -> ParamValue {
        ParamValue::List(self.split(MULTI_VALUE_SEPARATOR).map(ToString::to_string).collect())
    }
}

impl IntoParamValue for String {
    fn into_param_value(self) -> ParamValue {
        self.as_str().into_param_value()
    }
}

impl IntoParamValue for &String {
    fn into_param_value(self) -> ParamValue {
        self.as_str().into_param_value()
    }
}

impl IntoParamValue for bool {
    fn into_param_value(self) -> ParamValue {
        ParamValue::Flag(self)
    }
}

impl IntoParamValue for DateTime<Utc> {
    fn into_param_value(self) -> ParamValue {
        ParamValue::List(vec![self.format(TIMESTAMP_FORMAT).to_string()])
    }
}

impl IntoParamValue for OptionSet {
    fn into_param_value(self) -> ParamValue {
        ParamValue::Options(self)
    }
}

impl<T: IntoParamValue> IntoParamValue for Option<T> {
    fn into_param_value(self) -> ParamValue {
        match self {
            Some(value) => value.into_param_value(),
            None => ParamValue::Flag(false),
        }
    }
}

impl<T: fmt::Display> IntoParamValue for Vec<T> {
    fn into_param_value(self) -> ParamValue {
        ParamValue::List(self.iter().map(ToString::to_string).collect())
    }
}

impl<T: fmt::Display> IntoParamValue for &[T] {
    fn into_param_value(self) -> ParamValue {
        ParamValue::List(self.iter().map(ToString::to_string).collect())
    }
}

impl<T: fmt::Display, const N: usize> IntoParamValue for [T; N] {
    fn into_param_value(self) -> ParamValue {
        ParamValue::List(self.iter().map(ToString::to_string).collect())
    }
}

macro_rules! scalar_param_value {
    ($($ty:ty),*) => {
        $(
            impl IntoParamValue for $ty {
                fn into_param_value(self) -> ParamValue {
                    ParamValue::List(vec![self.to_string()])
                }
            }
        )*
    };
}

scalar_param_value!(i32, i64, u32, u64, usize, f64);

/// A value that stands for a page on a specific site.
pub trait PageLike {
    fn title(&self) -> String;
    fn site(&self) -> &SiteIdentity;
}

/// Ordered, multi-valued request parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    entries: Vec<(String, ParamValue)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: IntoParamValue,
    {
        let mut params = Self::new();
        for (key, value) in pairs {
            params.set(key, value);
        }
        params
    }

    /// Replace the value of `key`, keeping its position when it already exists.
    pub fn set(&mut self, key: impl Into<String>, value: impl IntoParamValue) {
        let key = key.into();
        let value = value.into_param_value();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Set `key` only when it is not present yet. Returns whether a value was written.
    pub fn set_default(&mut self, key: &str, value: impl IntoParamValue) -> bool {
        if self.contains_key(key) {
            return false;
        }
        self.set(key, value);
        true
    }

    pub fn set_bytes(&mut self, key: impl Into<String>, bytes: &[u8], encoding: SiteEncoding) {
        let decoded = encoding.decode(bytes);
        self.set(key, decoded);
    }

    /// Set page-like values by title. Values from another site are rejected.
    pub fn set_pages<P: PageLike>(
        &mut self,
        key: impl Into<String>,
        pages: &[P],
        site: &SiteIdentity,
    ) -> Result<()> {
        let key = key.into();
        let mut titles = Vec::with_capacity(pages.len());
        for page in pages {
            if page.site() != site {
                return Err(Error::Misuse(format!(
                    "parameter '{key}': '{}' belongs to {}, not {site}",
                    page.title(),
                    page.site()
                )));
            }
            titles.push(page.title());
        }
        self.set(key, ParamValue::List(titles));
        Ok(())
    }

    /// Append list items that are not present yet.
    pub fn add_values(&mut self, key: &str, values: &[&str]) {
        match self.entries.iter_mut().find(|(existing, _)| existing == key) {
            Some((_, ParamValue::List(existing))) => {
                for value in values {
                    if !existing.iter().any(|item| item == value) {
                        existing.push((*value).to_string());
                    }
                }
            }
            Some(entry) => {
                entry.1 = ParamValue::List(values.iter().map(ToString::to_string).collect());
            }
            None => self.entries.push((
                key.to_string(),
                ParamValue::List(values.iter().map(ToString::to_string).collect()),
            )),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    /// List items of `key`; empty for absent keys and non-list values.
    pub fn values(&self, key: &str) -> &[String] {
        match self.get(key) {
            Some(ParamValue::List(values)) => values,
            _ => &[],
        }
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.values(key).first().map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(existing, _)| existing == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        let index = self.entries.iter().position(|(existing, _)| existing == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire-ready values in insertion order.
    pub fn encode(&self, encoding: SiteEncoding) -> EncodedParams {
        let mut pairs = Vec::with_capacity(self.entries.len());
        for (key, value) in &self.entries {
            let Some(items) = value.wire_items() else {
                continue;
            };
            let joined = if items.iter().any(|item| item.contains(MULTI_VALUE_SEPARATOR)) {
                format!("{ALTERNATIVE_SEPARATOR}{}", items.join(ALTERNATIVE_SEPARATOR))
            } else {
                items.join(MULTI_VALUE_SEPARATOR)
            };
            pairs.push((key.clone(), encode_value(key, &joined, encoding)));
        }
        EncodedParams { pairs }
    }

    pub fn to_query_string(&self, encoding: SiteEncoding) -> String {
        self.encode(encoding).to_query_string()
    }
}

fn encode_value(key: &str, value: &str, encoding: SiteEncoding) -> Vec<u8> {
    if value.is_ascii() {
        return value.as_bytes().to_vec();
    }
    match encoding.encode(value) {
        Some(bytes) => bytes,
        None => {
            tracing::error!(
                parameter = key,
                encoding = encoding.as_str(),
                "cannot encode parameter value in site encoding; sending UTF-8"
            );
            value.as_bytes().to_vec()
        }
    }
}

/// Ordering rank on the wire: plain keys, then token keys, then [`LAST_TOKEN`].
pub fn token_rank(key: &str) -> u8 {
    if key == LAST_TOKEN {
        2
    } else if key.ends_with(TOKEN_SUFFIX) {
        1
    } else {
        0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedParams {
    pairs: Vec<(String, Vec<u8>)>,
}

impl EncodedParams {
    pub fn pairs(&self) -> &[(String, Vec<u8>)] {
        &self.pairs
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_slice())
    }

    pub fn get_str(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(key).map(String::from_utf8_lossy)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Pairs in wire order. The sort is stable, so ties keep insertion order.
    pub fn wire_pairs(&self) -> Vec<(&str, &[u8])> {
        let mut ordered = self
            .pairs
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_slice()))
            .collect::<Vec<_>>();
        ordered.sort_by_key(|(key, _)| token_rank(key));
        ordered
    }

    pub fn to_query_string(&self) -> String {
        self.wire_pairs()
            .into_iter()
            .map(|(key, value)| format!("{}={}", percent_encode(key.as_bytes()), percent_encode(value)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Key-sorted rendering, independent of insertion order.
    pub fn canonical(&self) -> String {
        let mut ordered = self.pairs.iter().collect::<Vec<_>>();
        ordered.sort();
        ordered
            .into_iter()
            .map(|(key, value)| format!("{}={}", percent_encode(key.as_bytes()), percent_encode(value)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Lossy text pairs for diagnostics.
    pub fn display_pairs(&self) -> Vec<(String, String)> {
        self.pairs
            .iter()
            .map(|(key, value)| (key.clone(), String::from_utf8_lossy(value).into_owned()))
            .collect()
    }
}

fn percent_encode(bytes: &[u8]) -> String {
    form_urlencoded::byte_serialize(bytes).collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{
        IntoParamValue, OptionSet, PageLike, ParamValue, ParameterSet, SiteEncoding, token_rank,
    };
    use crate::site::SiteIdentity;

    struct Page {
        title: &'static str,
        site: SiteIdentity,
    }

    impl PageLike for Page {
        fn title(&self) -> String {
            self.title.to_string()
        }

        fn site(&self) -> &SiteIdentity {
            &self.site
        }
    }

    fn wiki(code: &str) -> SiteIdentity {
        SiteIdentity::new("wikipedia", code)
    }

    #[test]
    fn strings_split_on_pipe_and_sequences_keep_items() {
        let mut params = ParameterSet::new();
        params.set("prop", "info|revisions");
        params.set("titles", vec!["A", "B"]);
        params.set("rclimit", 50usize);
        assert_eq!(params.values("prop"), ["info", "revisions"]);
        assert_eq!(params.values("titles"), ["A", "B"]);
        assert_eq!(params.first("rclimit"), Some("50"));
    }

    #[test]
    fn set_keeps_position_of_existing_key() {
        let mut params = ParameterSet::from_pairs([("action", "query"), ("list", "allpages")]);
        params.set("action", "parse");
        assert_eq!(params.keys().collect::<Vec<_>>(), ["action", "list"]);
        assert_eq!(params.first("action"), Some("parse"));
    }

    #[test]
    fn booleans_render_as_empty_or_are_omitted() {
        let mut params = ParameterSet::new();
        params.set("redirects", true);
        params.set("bot", false);
        params.set("summary", None::<String>);
        params.set("continue", "");
        params.set("titles", Vec::<String>::new());
        let encoded = params.encode(SiteEncoding::Utf8);
        assert_eq!(encoded.get("redirects"), Some(&b""[..]));
        assert_eq!(encoded.get("continue"), Some(&b""[..]));
        assert!(encoded.get("bot").is_none());
        assert!(encoded.get("summary").is_none());
        assert!(encoded.get("titles").is_none());
    }

    #[test]
    fn timestamps_render_as_iso_8601() {
        let mut params = ParameterSet::new();
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 9, 11).single().expect("timestamp");
        params.set("rcstart", at);
        assert_eq!(params.first("rcstart"), Some("2024-03-05T07:09:11Z"));
    }

    #[test]
    fn bytes_are_decoded_with_site_encoding() {
        let mut params = ParameterSet::new();
        params.set_bytes("titles", &[0x43, 0x61, 0x66, 0xe9], SiteEncoding::Latin1);
        assert_eq!(params.first("titles"), Some("Café"));
    }

    #[test]
    fn page_values_from_another_site_are_rejected() {
        let mut params = ParameterSet::new();
        let home = wiki("en");
        let pages = [Page { title: "Alpha", site: wiki("en") }, Page { title: "Beta", site: wiki("en") }];
        params.set_pages("titles", &pages, &home).expect("same site");
        assert_eq!(params.values("titles"), ["Alpha", "Beta"]);

        let foreign = [Page { title: "Gamma", site: wiki("de") }];
        let error = params.set_pages("titles", &foreign, &home).expect_err("cross-site");
        assert!(error.to_string().contains("wikipedia:de"));
    }

    #[test]
    fn option_sets_render_enabled_and_disabled_items() {
        let options = OptionSet::parse("minor|!bot").expect("parse");
        let mut params = ParameterSet::new();
        params.set("rcshow", options);
        assert_eq!(params.to_query_string(SiteEncoding::Utf8), "rcshow=minor%7C%21bot");

        let mut restricted = OptionSet::with_allowed(["minor", "bot"]);
        restricted.enable("minor").expect("allowed");
        assert!(restricted.disable("anon").is_err());
        assert_eq!(restricted.get("minor"), Some(true));
    }

    #[test]
    fn empty_option_set_is_omitted() {
        let mut params = ParameterSet::new();
        params.set("rcshow", OptionSet::new());
        assert!(params.encode(SiteEncoding::Utf8).is_empty());
    }

    #[test]
    fn encode_is_idempotent() {
        let mut params = ParameterSet::from_pairs([("action", "query"), ("titles", "Ä|B")]);
        params.set("redirects", true);
        let first = params.encode(SiteEncoding::Utf8);
        let second = params.encode(SiteEncoding::Utf8);
        assert_eq!(first, second);
        assert_eq!(first.to_query_string(), second.to_query_string());
    }

    #[test]
    fn values_containing_pipes_use_alternative_separator() {
        let mut params = ParameterSet::new();
        params.set("titles", vec!["A|B", "C"]);
        let encoded = params.encode(SiteEncoding::Utf8);
        assert_eq!(encoded.get("titles"), Some("\u{1f}A|B\u{1f}C".as_bytes()));
    }

    #[test]
    fn non_ascii_values_use_site_encoding_with_utf8_fallback() {
        let params = ParameterSet::from_pairs([("titles", "Café")]);
        let latin = params.encode(SiteEncoding::Latin1);
        assert_eq!(latin.get("titles"), Some(&[0x43, 0x61, 0x66, 0xe9][..]));

        let params = ParameterSet::from_pairs([("titles", "日本")]);
        let fallback = params.encode(SiteEncoding::Latin1);
        assert_eq!(fallback.get("titles"), Some("日本".as_bytes()));
    }

    #[test]
    fn token_keys_sort_last_and_edit_token_is_final() {
        let params = ParameterSet::from_pairs([
            ("wpEditToken", "w"),
            ("token", "t"),
            ("action", "edit"),
            ("csrftoken", "c"),
            ("title", "Alpha"),
        ]);
        let query = params.to_query_string(SiteEncoding::Utf8);
        assert_eq!(query, "action=edit&title=Alpha&token=t&csrftoken=c&wpEditToken=w");
        assert_eq!(token_rank("action"), 0);
        assert_eq!(token_rank("logintoken"), 1);
        assert_eq!(token_rank("wpEditToken"), 2);
    }

    #[test]
    fn canonical_form_ignores_insertion_order() {
        let left = ParameterSet::from_pairs([("action", "query"), ("list", "allpages")]);
        let right = ParameterSet::from_pairs([("list", "allpages"), ("action", "query")]);
        assert_eq!(
            left.encode(SiteEncoding::Utf8).canonical(),
            right.encode(SiteEncoding::Utf8).canonical()
        );
    }

    #[test]
    fn add_values_appends_without_duplicates() {
        let mut params = ParameterSet::from_pairs([("meta", "siteinfo")]);
        params.add_values("meta", &["userinfo", "siteinfo"]);
        assert_eq!(params.values("meta"), ["siteinfo", "userinfo"]);
        params.add_values("list", &["allpages"]);
        assert_eq!(params.values("list"), ["allpages"]);
        assert_eq!("x".into_param_value(), ParamValue::List(vec!["x".to_string()]));
    }
}
