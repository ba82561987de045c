//! Destination extraction from a parsed request-target.

use super::request::ParsedRequest;

/// Split a CONNECT request's authority-form target (`host:port`).
pub(crate) fn parse_connect_authority(path: &str) -> Option<(String, u16)> {
    let (host, port_str) = path.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port_str.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}

/// Resolve the destination host/port and the origin-form path to send
/// upstream, from either an absolute-form request-target (the ordinary
/// forward-proxy case for plain HTTP) or an origin-form one paired with a
/// `Host:` header.
pub(crate) fn resolve_target(req: &ParsedRequest) -> Option<(String, u16, String)> {
    if let Some(rest) = req.path.strip_prefix("http://") {
        return split_absolute_form(rest, 80);
    }
    if let Some(rest) = req.path.strip_prefix("https://") {
        return split_absolute_form(rest, 443);
    }
    if req.path.starts_with('/') {
        let host_header = extract_host_header(&req.headers)?;
        let (host, port) = split_host_port(&host_header, 80)?;
        return Some((host, port, req.path.clone()));
    }
    None
}

fn split_absolute_form(rest: &str, default_port: u16) -> Option<(String, u16, String)> {
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = split_host_port(authority, default_port)?;
    Some((host, port, path.to_string()))
}

fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }
    if let Some(idx) = authority.rfind(':') {
        let (host, port_str) = authority.split_at(idx);
        if let Ok(port) = port_str[1..].parse::<u16>() {
            return Some((host.to_string(), port));
        }
    }
    Some((authority.to_string(), default_port))
}

fn extract_host_header(headers: &str) -> Option<String> {
    for line in headers.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("host") {
            return Some(value.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_connect_authority_splits_host_and_port() {
        assert_eq!(
            parse_connect_authority("example.com:443"),
            Some(("example.com".to_string(), 443))
        );
    }

    #[test]
    fn parse_connect_authority_rejects_missing_port() {
        assert_eq!(parse_connect_authority("example.com"), None);
    }

    #[test]
    fn split_absolute_form_defaults_port_and_keeps_path() {
        let result = split_absolute_form("example.com/foo/bar", 80);
        assert_eq!(result, Some(("example.com".to_string(), 80, "/foo/bar".to_string())));
    }

    #[test]
    fn split_absolute_form_with_explicit_port_and_no_path() {
        let result = split_absolute_form("example.com:8080", 80);
        assert_eq!(result, Some(("example.com".to_string(), 8080, "/".to_string())));
    }
}
