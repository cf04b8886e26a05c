//! Attribute filters for statistics queries

use crate::{Pageview, Session};
use std::collections::HashMap;
use tracing::warn;

/// Filterable and reportable session attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionField {
    Hostname,
    DeviceType,
    DeviceOs,
    BrowserName,
    BrowserVersion,
    BrowserLanguage,
    ScreenResolution,
    WindowResolution,
    CountryCode,
    City,
    AsName,
    Referrer,
}

impl SessionField {
    pub const ALL: [SessionField; 12] = [
        SessionField::Hostname,
        SessionField::DeviceType,
        SessionField::DeviceOs,
        SessionField::BrowserName,
        SessionField::BrowserVersion,
        SessionField::BrowserLanguage,
        SessionField::ScreenResolution,
        SessionField::WindowResolution,
        SessionField::CountryCode,
        SessionField::City,
        SessionField::AsName,
        SessionField::Referrer,
    ];

    /// Filter key of the field
    pub fn name(&self) -> &'static str {
        match self {
            SessionField::Hostname => "hostname",
            SessionField::DeviceType => "device_type",
            SessionField::DeviceOs => "device_os",
            SessionField::BrowserName => "browser_name",
            SessionField::BrowserVersion => "browser_version",
            SessionField::BrowserLanguage => "browser_language",
            SessionField::ScreenResolution => "screen_resolution",
            SessionField::WindowResolution => "window_resolution",
            SessionField::CountryCode => "country_code",
            SessionField::City => "city",
            SessionField::AsName => "as_name",
            SessionField::Referrer => "referrer",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }

    pub fn get<'a>(&self, session: &'a Session) -> &'a str {
        match self {
            SessionField::Hostname => &session.hostname,
            SessionField::DeviceType => &session.device_type,
            SessionField::DeviceOs => &session.device_os,
            SessionField::BrowserName => &session.browser_name,
            SessionField::BrowserVersion => &session.browser_version,
            SessionField::BrowserLanguage => &session.browser_language,
            SessionField::ScreenResolution => &session.screen_resolution,
            SessionField::WindowResolution => &session.window_resolution,
            SessionField::CountryCode => &session.country_code,
            SessionField::City => &session.city,
            SessionField::AsName => &session.as_name,
            SessionField::Referrer => &session.referrer,
        }
    }
}

/// Filterable and reportable pageview attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageviewField {
    Path,
    QueryString,
}

impl PageviewField {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "page" | "path" => Some(PageviewField::Path),
            "query_string" => Some(PageviewField::QueryString),
            _ => None,
        }
    }

    pub fn get<'a>(&self, pageview: &'a Pageview) -> &'a str {
        match self {
            PageviewField::Path => &pageview.path,
            PageviewField::QueryString => &pageview.query_string,
        }
    }
}

/// Conjunction of exact-match attribute conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    session: Vec<(SessionField, String)>,
    pageview_count: Option<usize>,
    pageview: Vec<(PageviewField, String)>,
}

impl Filter {
    /// Build a filter from query parameters; `None` when there are none
    pub fn from_map(map: &HashMap<String, String>) -> Option<Self> {
        if map.is_empty() {
            return None;
        }

        let mut filter = Filter::default();
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        for key in keys {
            let value = &map[key];
            if let Some(field) = SessionField::parse(key) {
                filter.session.push((field, value.clone()));
            } else if let Some(field) = PageviewField::parse(key) {
                filter.pageview.push((field, value.clone()));
            } else if key == "pageview_count" {
                match value.parse() {
                    Ok(n) => filter.pageview_count = Some(n),
                    Err(_) => warn!("Ignoring bad pageview_count filter: {:?}", value),
                }
            } else {
                warn!("Ignoring unknown filter key: {:?}", key);
            }
        }
        Some(filter)
    }

    /// Whether admission depends on a session's pageviews
    pub fn has_pageview_filter(&self) -> bool {
        !self.pageview.is_empty()
    }

    /// Check the session attribute conditions, excluding pageview ones
    pub fn matches_session(&self, session: &Session) -> bool {
        self.session
            .iter()
            .all(|(field, value)| field.get(session) == value.as_str())
    }

    pub fn matches_pageview_count(&self, count: usize) -> bool {
        self.pageview_count.map_or(true, |n| n == count)
    }

    pub fn matches_pageview(&self, pageview: &Pageview) -> bool {
        self.pageview
            .iter()
            .all(|(field, value)| field.get(pageview) == value.as_str())
    }

    /// Full admission test for a session with its pageviews
    pub fn admits<'a, I>(&self, session: &Session, pageviews: I) -> bool
    where
        I: IntoIterator<Item = &'a Pageview>,
    {
        if !self.matches_session(session) {
            return false;
        }
        let mut count = 0;
        let mut any_match = false;
        for pageview in pageviews {
            count += 1;
            any_match = any_match || self.matches_pageview(pageview);
        }
        self.matches_pageview_count(count) && (!self.has_pageview_filter() || any_match)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pageview(path: &str) -> Pageview {
        Pageview {
            path: path.into(),
            query_string: String::new(),
        }
    }

    #[test]
    fn test_empty_map_means_no_filter() {
        assert!(Filter::from_map(&HashMap::new()).is_none());
        assert!(Filter::from_map(&map(&[("nonsense", "1")])).is_some());
    }

    #[test]
    fn test_session_fields() {
        let filter = Filter::from_map(&map(&[("browser_name", "Firefox"), ("country_code", "HU")])).unwrap();
        let mut session = Session {
            browser_name: "Firefox".into(),
            country_code: "HU".into(),
            ..Default::default()
        };
        assert!(filter.matches_session(&session));
        session.country_code = "AT".into();
        assert!(!filter.matches_session(&session));
    }

    #[test]
    fn test_pageview_filter_requires_a_matching_pageview() {
        let filter = Filter::from_map(&map(&[("page", "dl")])).unwrap();
        assert!(filter.has_pageview_filter());
        let session = Session::default();

        let views = [pageview("/"), pageview("dl")];
        assert!(filter.admits(&session, views.iter()));
        let views = [pageview("/"), pageview("/about")];
        assert!(!filter.admits(&session, views.iter()));
        assert!(!filter.admits(&session, std::iter::empty()));
    }

    #[test]
    fn test_pageview_count() {
        let filter = Filter::from_map(&map(&[("pageview_count", "2")])).unwrap();
        let session = Session::default();
        let views = [pageview("/a"), pageview("/b")];
        assert!(filter.admits(&session, views.iter()));
        assert!(!filter.admits(&session, views[..1].iter()));

        // unparsable counts are ignored
        let filter = Filter::from_map(&map(&[("pageview_count", "two")])).unwrap();
        assert!(filter.admits(&session, views[..1].iter()));
    }

    #[test]
    fn test_field_names_round_trip() {
        for field in SessionField::ALL {
            assert_eq!(SessionField::parse(field.name()), Some(field));
        }
        assert_eq!(PageviewField::parse("path"), Some(PageviewField::Path));
        assert_eq!(PageviewField::parse("query_string"), Some(PageviewField::QueryString));
    }
}
