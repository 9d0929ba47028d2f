use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Cookie name → value, ordered so the rendered header is stable.
pub type CookieMap = BTreeMap<String, String>;

#[derive(Debug, Deserialize)]
struct CookieEntry {
    name: String,
    #[serde(default)]
    value: String,
}

/// `cookies.json` is either a browser export (array of `{name, value, ...}`)
/// or a flat object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CookieFile {
    List(Vec<CookieEntry>),
    Map(BTreeMap<String, String>),
}

/// Parses a `Cookie` header style string: `a=1; b=2`.
pub fn parse_cookie_header(raw: &str) -> CookieMap {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn parse_cookies_json(raw: &str) -> Result<CookieMap, String> {
    let file: CookieFile = serde_json::from_str(raw).map_err(|err| err.to_string())?;
    Ok(match file {
        CookieFile::List(entries) => entries
            .into_iter()
            .filter(|e| !e.name.trim().is_empty())
            .map(|e| (e.name, e.value))
            .collect(),
        CookieFile::Map(map) => map,
    })
}

pub fn cookie_header(cookies: &CookieMap) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Reads a cookie file. A missing file is not an error; an unreadable or
/// malformed one is logged and ignored.
pub fn load_cookies_file(path: &Path) -> Option<CookieMap> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::warn!(path = %path.display(), "failed to read cookie file: {err}");
            return None;
        }
    };
    match parse_cookies_json(&raw) {
        Ok(map) => Some(map),
        Err(err) => {
            tracing::warn!(path = %path.display(), "ignoring malformed cookie file: {err}");
            None
        }
    }
}

/// `DEFAULT_COOKIES` wins; otherwise the cookie file, otherwise no cookies.
pub fn resolve_default_cookies(env_value: Option<&str>, cookie_file: &Path) -> String {
    if let Some(raw) = env_value.map(str::trim).filter(|v| !v.is_empty()) {
        return cookie_header(&parse_cookie_header(raw));
    }
    load_cookies_file(cookie_file)
        .map(|map| cookie_header(&map))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_string_is_split_and_trimmed() {
        let map = parse_cookie_header(" _U=abc ; SRCHHPGUSR=x=y;;broken; =v");
        assert_eq!(map.get("_U").map(String::as_str), Some("abc"));
        assert_eq!(map.get("SRCHHPGUSR").map(String::as_str), Some("x=y"));
        assert_eq!(map.len(), 2);
        assert_eq!(cookie_header(&map), "SRCHHPGUSR=x=y; _U=abc");
    }

    #[test]
    fn json_accepts_browser_export_and_flat_map() {
        let list = parse_cookies_json(
            r#"[{"name":"_U","value":"abc","domain":".bing.com"},{"name":"KievRPSSecAuth","value":"k"}]"#,
        )
        .unwrap();
        assert_eq!(cookie_header(&list), "KievRPSSecAuth=k; _U=abc");

        let map = parse_cookies_json(r#"{"_U":"abc"}"#).unwrap();
        assert_eq!(cookie_header(&map), "_U=abc");

        assert!(parse_cookies_json("[1,2]").is_err());
    }
}
