use chrono::format::{Item, StrftimeItems};
use chrono::Local;

/// Decode a url-escaped value. Returns `None` when an escape sequence is
/// malformed or decodes to invalid UTF-8.
pub fn url_unescape(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_val(*bytes.get(i + 1)?)?;
                let lo = hex_val(*bytes.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Expand strftime-style specifiers in a dump file name against the
/// current local time. An invalid pattern is returned untouched rather
/// than failing the stream start.
pub fn strftime_now(pattern: &str) -> String {
    let items: Vec<Item<'_>> = StrftimeItems::new(pattern).collect();
    if items.iter().any(|i| matches!(i, Item::Error)) {
        return pattern.to_string();
    }
    Local::now().format_with_items(items.into_iter()).to_string()
}

/// Parse a bitrate hint out of a mount name of the shape `*[N]`, where N
/// is in kbit/s. Returns bytes per second.
pub fn rate_hint_from_mount(mount: &str) -> Option<u64> {
    let open = mount.rfind('[')?;
    let close = mount.rfind(']')?;
    if close <= open + 1 {
        return None;
    }
    let kbps: u64 = mount[open + 1..close].parse().ok()?;
    Some(kbps * 1000 / 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_plain_and_escaped() {
        assert_eq!(url_unescape("stereo").as_deref(), Some("stereo"));
        assert_eq!(url_unescape("a%20b+c").as_deref(), Some("a b c"));
        assert_eq!(url_unescape("%2Flive").as_deref(), Some("/live"));
        assert!(url_unescape("%zz").is_none());
        assert!(url_unescape("%2").is_none());
    }

    #[test]
    fn strftime_bad_pattern_left_alone() {
        assert_eq!(strftime_now("/tmp/dump-%!"), "/tmp/dump-%!");
        let expanded = strftime_now("/tmp/dump-%Y");
        assert!(expanded.starts_with("/tmp/dump-2"));
    }

    #[test]
    fn mount_rate_hints() {
        assert_eq!(rate_hint_from_mount("/jazz[128]"), Some(16_000));
        assert_eq!(rate_hint_from_mount("/jazz"), None);
        assert_eq!(rate_hint_from_mount("/jazz[]"), None);
        assert_eq!(rate_hint_from_mount("/jazz[abc]"), None);
    }
}
