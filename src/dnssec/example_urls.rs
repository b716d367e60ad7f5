//! Example URL synthesis
//!
//! Turns a delivery service's host regexes into the concrete URLs whose
//! zones its DNSSEC keys cover.

use regex::Regex;
use tracing::warn;
use url::Url;

use super::{DnssecError, DsType, MatchEntry, MatchType};

/// URL schemes selected by a delivery service protocol value
pub fn protocol_schemes(protocol: Option<i64>) -> &'static [&'static str] {
    match protocol {
        Some(1) => &["https"],
        Some(2) | Some(3) => &["http", "https"],
        _ => &["http"],
    }
}

/// Build the example URLs for a delivery service.
///
/// One URL per `HOST_REGEXP` entry per scheme, in match-list order. The
/// output is not deduplicated; callers rely on positional correspondence.
pub fn build(
    protocol: Option<i64>,
    ds_type: DsType,
    routing_name: &str,
    match_list: &[MatchEntry],
    cdn_domain: &str,
) -> Result<Vec<String>, DnssecError> {
    if !ds_type.is_signed() {
        return Ok(Vec::new());
    }

    let hosts: Vec<&MatchEntry> = match_list
        .iter()
        .filter(|m| m.match_type == MatchType::HostRegexp)
        .collect();
    if hosts.is_empty() {
        return Err(DnssecError::MatchList(format!(
            "match list has no {} entry",
            MatchType::HostRegexp
        )));
    }

    let schemes = protocol_schemes(protocol);
    let mut urls = Vec::with_capacity(hosts.len() * schemes.len());
    for entry in hosts {
        let host = example_host(entry, routing_name, cdn_domain)?;
        for scheme in schemes {
            urls.push(format!("{}://{}", scheme, host));
        }
    }
    Ok(urls)
}

/// Concrete hostname for one host regex.
///
/// Set 0 is the routing regex: a leading `.*` becomes the routing name and a
/// trailing `.*` the CDN domain. Other sets hold literal hostnames.
fn example_host(entry: &MatchEntry, routing_name: &str, cdn_domain: &str) -> Result<String, DnssecError> {
    if entry.set_number != 0 {
        return Ok(entry.pattern.replace('\\', ""));
    }

    let pattern = entry.pattern.trim_start_matches('^').trim_end_matches('$');
    let unescaped = pattern.replace('\\', "");

    let (lead, rest) = match unescaped.strip_prefix(".*") {
        Some(rest) => (routing_name, rest),
        None => ("", unescaped.as_str()),
    };
    let (middle, trail) = match rest.strip_suffix(".*") {
        Some(middle) => (middle, cdn_domain),
        None => (rest, ""),
    };
    let host = format!("{}{}{}", lead, middle.replace(".*", ""), trail);

    let matcher = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
        DnssecError::MatchList(format!("invalid host regex '{}': {}", entry.pattern, e))
    })?;
    if !matcher.is_match(&host) {
        warn!("Example host {} does not match its regex '{}'", host, entry.pattern);
    }

    Ok(host)
}

/// Zone signed by a delivery service key: the example URL's host without
/// its routing-name label, as an absolute name.
///
/// `https://cdn.example.mycdn.com` → `example.mycdn.com.`
pub fn ds_zone_name(example_url: &str) -> Result<String, DnssecError> {
    let url = Url::parse(example_url)
        .map_err(|e| DnssecError::MatchList(format!("parsing example URL '{}': {}", example_url, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| DnssecError::MatchList(format!("example URL '{}' has no host", example_url)))?;

    match host.split_once('.') {
        Some((_, zone)) if !zone.is_empty() => Ok(format!("{}.", zone.trim_end_matches('.'))),
        _ => Err(DnssecError::MatchList(format!(
            "example URL host '{}' has no parent zone",
            host
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(match_type: MatchType, pattern: &str) -> MatchEntry {
        MatchEntry {
            match_type,
            pattern: pattern.to_string(),
            set_number: 0,
        }
    }

    #[test]
    fn test_routing_regex_substitution() {
        let urls = build(
            Some(0),
            DsType::Http,
            "cdn",
            &[MatchEntry::host(r".*\.example\..*")],
            "mycdn.com",
        )
        .unwrap();

        assert_eq!(urls, vec!["http://cdn.example.mycdn.com"]);
    }

    #[test]
    fn test_protocol_schemes() {
        assert_eq!(protocol_schemes(None), &["http"]);
        assert_eq!(protocol_schemes(Some(0)), &["http"]);
        assert_eq!(protocol_schemes(Some(1)), &["https"]);
        assert_eq!(protocol_schemes(Some(2)), &["http", "https"]);
        assert_eq!(protocol_schemes(Some(3)), &["http", "https"]);
        assert_eq!(protocol_schemes(Some(7)), &["http"]);
    }

    #[test]
    fn test_order_is_host_then_scheme() {
        let urls = build(
            Some(2),
            DsType::Dns,
            "edge",
            &[MatchEntry::host(r".*\.one\..*"), MatchEntry::host(r".*\.two\..*")],
            "mycdn.com",
        )
        .unwrap();

        assert_eq!(
            urls,
            vec![
                "http://edge.one.mycdn.com",
                "https://edge.one.mycdn.com",
                "http://edge.two.mycdn.com",
                "https://edge.two.mycdn.com",
            ]
        );
    }

    #[test]
    fn test_duplicates_are_kept() {
        let urls = build(
            Some(0),
            DsType::Http,
            "cdn",
            &[MatchEntry::host(r".*\.same\..*"), MatchEntry::host(r".*\.same\..*")],
            "mycdn.com",
        )
        .unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0], urls[1]);
    }

    #[test]
    fn test_only_host_regexes_contribute() {
        let urls = build(
            Some(1),
            DsType::Http,
            "cdn",
            &[
                entry(MatchType::PathRegexp, "/images/.*"),
                MatchEntry::host(r".*\.video\..*"),
                entry(MatchType::HeaderRegexp, "X-Foo: .*"),
            ],
            "mycdn.com",
        )
        .unwrap();

        assert_eq!(urls, vec!["https://cdn.video.mycdn.com"]);
    }

    #[test]
    fn test_literal_host_sets() {
        let mut literal = MatchEntry::host(r"video\.customer\.com");
        literal.set_number = 1;

        let urls = build(
            Some(0),
            DsType::Http,
            "cdn",
            &[MatchEntry::host(r".*\.video\..*"), literal],
            "mycdn.com",
        )
        .unwrap();

        assert_eq!(urls, vec!["http://cdn.video.mycdn.com", "http://video.customer.com"]);
    }

    #[test]
    fn test_unsigned_types_yield_nothing() {
        let list = [MatchEntry::host(r".*\.any\..*")];
        assert!(build(Some(0), DsType::AnyMap, "cdn", &list, "mycdn.com").unwrap().is_empty());
        assert!(build(Some(0), DsType::Steering, "cdn", &list, "mycdn.com").unwrap().is_empty());
        // Not even an empty match list is an error for them
        assert!(build(Some(0), DsType::ClientSteering, "cdn", &[], "mycdn.com").unwrap().is_empty());
    }

    #[test]
    fn test_missing_host_regex_is_an_error() {
        let err = build(
            Some(0),
            DsType::Http,
            "cdn",
            &[entry(MatchType::PathRegexp, "/.*")],
            "mycdn.com",
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::dnssec::ErrorKind::MatchList);

        assert!(build(Some(0), DsType::Dns, "cdn", &[], "mycdn.com").is_err());
    }

    #[test]
    fn test_invalid_regex_is_an_error() {
        let err = build(Some(0), DsType::Http, "cdn", &[MatchEntry::host(r".*\.(bad\..*")], "mycdn.com")
            .unwrap_err();
        assert!(err.to_string().contains("invalid host regex"));
    }

    #[test]
    fn test_ds_zone_name() {
        assert_eq!(
            ds_zone_name("https://cdn.example.mycdn.com").unwrap(),
            "example.mycdn.com."
        );
        assert_eq!(
            ds_zone_name("http://CDN.Video.MyCDN.com/").unwrap(),
            "video.mycdn.com."
        );
        assert!(ds_zone_name("http://localhost").is_err());
        assert!(ds_zone_name("not a url").is_err());
    }

    proptest! {
        #[test]
        fn prop_url_count_is_hosts_times_schemes(
            protocol in 0i64..4,
            host_count in 1usize..6,
            path_count in 0usize..4,
        ) {
            let mut list = Vec::new();
            for i in 0..host_count {
                list.push(MatchEntry::host(format!(r".*\.ds{}\..*", i)));
            }
            for i in 0..path_count {
                list.push(entry(MatchType::PathRegexp, &format!("/p{}/.*", i)));
            }

            let urls = build(Some(protocol), DsType::Http, "cdn", &list, "mycdn.com").unwrap();
            prop_assert_eq!(urls.len(), host_count * protocol_schemes(Some(protocol)).len());
        }
    }
}
