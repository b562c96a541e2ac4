use axum::http::{HeaderMap, HeaderName, HeaderValue};
use rand::Rng;
use rand::seq::SliceRandom;

const CHROME_VERSIONS: std::ops::RangeInclusive<u32> = 120..=143;
const FIREFOX_VERSIONS: std::ops::RangeInclusive<u32> = 120..=135;
const EDGE_VERSIONS: std::ops::RangeInclusive<u32> = 120..=135;
const SAFARI_VERSIONS: &[&str] = &["17.0", "17.1", "17.2", "17.3", "17.4", "17.5", "18.0", "18.1", "18.2"];
const WINDOWS_VERSIONS: &[&str] = &["10.0", "11.0"];
const MAC_VERSIONS: &[&str] = &["10_15_7", "11_0", "12_0", "13_0", "14_0", "15_0"];
const PLATFORMS: &[&str] = &["Windows", "macOS", "Linux"];
const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9,en-US;q=0.8",
    "zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7",
    "zh-TW,zh;q=0.9,en-US;q=0.8,en;q=0.7",
    "ja-JP,ja;q=0.9,en-US;q=0.8,en;q=0.7",
    "ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7",
    "de-DE,de;q=0.9,en-US;q=0.8,en;q=0.7",
    "fr-FR,fr;q=0.9,en-US;q=0.8,en;q=0.7",
    "es-ES,es;q=0.9,en-US;q=0.8,en;q=0.7",
];
const PRIORITIES: &[&str] = &["u=1, i", "u=0, i", "u=1", "u=0"];
const FIXED_PRIORITY: &str = "u=1, i";

/// How the `Priority` header is chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Direct completion requests always send `u=1, i`.
    Fixed,
    /// Session and persona calls pick one at random.
    Random,
}

fn pick<'a, R: Rng + ?Sized>(rng: &mut R, items: &'a [&'a str]) -> &'a str {
    items.choose(rng).copied().unwrap_or_default()
}

pub fn random_user_agent<R: Rng + ?Sized>(rng: &mut R) -> String {
    match rng.gen_range(0..4) {
        0 => chrome_ua(rng),
        1 => firefox_ua(rng),
        2 => safari_ua(rng),
        _ => edge_ua(rng),
    }
}

fn chrome_ua<R: Rng + ?Sized>(rng: &mut R) -> String {
    let version = rng.gen_range(CHROME_VERSIONS);
    let build = rng.gen_range(0..9999);
    match rng.gen_range(0..3) {
        0 => format!(
            "Mozilla/5.0 (Windows NT {}; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version}.0.{build}.0 Safari/537.36",
            pick(rng, WINDOWS_VERSIONS)
        ),
        1 => format!(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X {}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version}.0.{build}.0 Safari/537.36",
            pick(rng, MAC_VERSIONS)
        ),
        _ => format!(
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version}.0.{build}.0 Safari/537.36"
        ),
    }
}

fn firefox_ua<R: Rng + ?Sized>(rng: &mut R) -> String {
    let version = rng.gen_range(FIREFOX_VERSIONS);
    match rng.gen_range(0..3) {
        0 => format!(
            "Mozilla/5.0 (Windows NT {}; Win64; x64; rv:{version}.0) Gecko/20100101 Firefox/{version}.0",
            pick(rng, WINDOWS_VERSIONS)
        ),
        1 => format!(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X {}; rv:{version}.0) Gecko/20100101 Firefox/{version}.0",
            pick(rng, MAC_VERSIONS)
        ),
        _ => format!(
            "Mozilla/5.0 (X11; Linux x86_64; rv:{version}.0) Gecko/20100101 Firefox/{version}.0"
        ),
    }
}

fn safari_ua<R: Rng + ?Sized>(rng: &mut R) -> String {
    let version = pick(rng, SAFARI_VERSIONS);
    let mac = pick(rng, MAC_VERSIONS);
    let webkit = rng.gen_range(600..700);
    format!(
        "Mozilla/5.0 (Macintosh; Intel Mac OS X {mac}) AppleWebKit/{webkit}.1.15 (KHTML, like Gecko) Version/{version} Safari/{webkit}.1.15"
    )
}

fn edge_ua<R: Rng + ?Sized>(rng: &mut R) -> String {
    let version = rng.gen_range(EDGE_VERSIONS);
    let chrome = rng.gen_range(CHROME_VERSIONS);
    let build = rng.gen_range(0..9999);
    format!(
        "Mozilla/5.0 (Windows NT {}; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{chrome}.0.{build}.0 Safari/537.36 Edg/{version}.0.{build}.0",
        pick(rng, WINDOWS_VERSIONS)
    )
}

pub fn random_sec_ch_ua<R: Rng + ?Sized>(rng: &mut R) -> String {
    let v = rng.gen_range(CHROME_VERSIONS);
    match rng.gen_range(0..4) {
        0 => format!(r#""Google Chrome";v="{v}", "Chromium";v="{v}", "Not_A Brand";v="24""#),
        1 => format!(r#""Chromium";v="{v}", "Google Chrome";v="{v}", "Not-A.Brand";v="99""#),
        2 => format!(r#""Google Chrome";v="{v}", "Not;A=Brand";v="8", "Chromium";v="{v}""#),
        _ => format!(r#""Not A(Brand";v="99", "Google Chrome";v="{v}", "Chromium";v="{v}""#),
    }
}

/// A full set of browser-like headers. Every call draws fresh values.
#[derive(Debug, Clone)]
pub struct BrowserFingerprint {
    pub user_agent: String,
    pub sec_ch_ua: String,
    pub sec_ch_ua_mobile: &'static str,
    pub sec_ch_ua_platform: String,
    pub accept_language: &'static str,
    pub priority: &'static str,
}

impl BrowserFingerprint {
    pub fn random(priority: Priority) -> Self {
        let mut rng = rand::thread_rng();
        Self::random_with(&mut rng, priority)
    }

    pub fn random_with<R: Rng + ?Sized>(rng: &mut R, priority: Priority) -> Self {
        let priority = match priority {
            Priority::Fixed => FIXED_PRIORITY,
            Priority::Random => PRIORITIES.choose(rng).copied().unwrap_or(FIXED_PRIORITY),
        };
        Self {
            user_agent: random_user_agent(rng),
            sec_ch_ua: random_sec_ch_ua(rng),
            // 10% 概率伪装为移动端
            sec_ch_ua_mobile: if rng.gen_range(0..10) < 1 { "?1" } else { "?0" },
            sec_ch_ua_platform: format!("\"{}\"", pick(rng, PLATFORMS)),
            accept_language: ACCEPT_LANGUAGES
                .choose(rng)
                .copied()
                .unwrap_or("en-US,en;q=0.9"),
            priority,
        }
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), v);
    }
}

/// Headers for any outbound upstream call. `origin` is `scheme://host` of the
/// upstream site; `credential` is attached as both `apikey` and bearer auth.
pub fn upstream_headers(origin: &str, priority: Priority, credential: Option<&str>) -> HeaderMap {
    let fp = BrowserFingerprint::random(priority);
    let mut headers = HeaderMap::new();
    insert(&mut headers, "content-type", "application/json");
    insert(&mut headers, "accept", "*/*");
    insert(&mut headers, "accept-language", fp.accept_language);
    insert(&mut headers, "user-agent", &fp.user_agent);
    insert(&mut headers, "sec-ch-ua", &fp.sec_ch_ua);
    insert(&mut headers, "sec-ch-ua-mobile", fp.sec_ch_ua_mobile);
    insert(&mut headers, "sec-ch-ua-platform", &fp.sec_ch_ua_platform);
    insert(&mut headers, "sec-fetch-dest", "empty");
    insert(&mut headers, "sec-fetch-mode", "cors");
    insert(&mut headers, "sec-fetch-site", "same-origin");
    insert(&mut headers, "priority", fp.priority);
    insert(&mut headers, "referer", &format!("{}/", origin.trim_end_matches('/')));
    insert(&mut headers, "origin", origin.trim_end_matches('/'));

    if let Some(key) = credential.filter(|k| !k.is_empty()) {
        insert(&mut headers, "apikey", key);
        insert(&mut headers, "authorization", &format!("Bearer {key}"));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_priority_is_stable() {
        for _ in 0..20 {
            let fp = BrowserFingerprint::random(Priority::Fixed);
            assert_eq!(fp.priority, "u=1, i");
        }
    }

    #[test]
    fn random_fingerprints_stay_within_catalogues() {
        for _ in 0..200 {
            let fp = BrowserFingerprint::random(Priority::Random);
            assert!(fp.user_agent.starts_with("Mozilla/5.0 ("));
            assert!(PRIORITIES.contains(&fp.priority));
            assert!(ACCEPT_LANGUAGES.contains(&fp.accept_language));
            assert!(fp.sec_ch_ua_mobile == "?0" || fp.sec_ch_ua_mobile == "?1");
            let platform = fp.sec_ch_ua_platform.trim_matches('"');
            assert!(PLATFORMS.contains(&platform));
            assert!(fp.sec_ch_ua.contains("Google Chrome"));
        }
    }

    #[test]
    fn headers_carry_origin_and_optional_credentials() {
        let with = upstream_headers("https://up.example", Priority::Fixed, Some("k1"));
        assert_eq!(with["origin"], "https://up.example");
        assert_eq!(with["referer"], "https://up.example/");
        assert_eq!(with["apikey"], "k1");
        assert_eq!(with["authorization"], "Bearer k1");
        assert_eq!(with["sec-fetch-mode"], "cors");

        let without = upstream_headers("https://up.example", Priority::Random, None);
        assert!(without.get("apikey").is_none());
        assert!(without.get("authorization").is_none());
    }
}
