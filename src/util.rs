pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Keep only the last `max_chars` characters (Unicode-safe).
pub fn tail_chars(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(count - max_chars).collect()
}

pub fn has_crlf(content: &str) -> bool {
    content.contains("\r\n")
}

pub fn to_lf(content: &str) -> String {
    content.replace("\r\n", "\n")
}

/// Convert LF text to CRLF without doubling existing CRLF pairs.
pub fn to_crlf(content: &str) -> String {
    to_lf(content).replace('\n', "\r\n")
}

#[cfg(test)]
mod tests {
    use super::{tail_chars, to_crlf, to_lf, truncate};

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_tail_chars_keeps_end() {
        assert_eq!(tail_chars("abcdef", 2), "ef");
        assert_eq!(tail_chars("ab", 5), "ab");
    }

    #[test]
    fn test_crlf_conversion_is_stable() {
        let mixed = "a\r\nb\nc";
        assert_eq!(to_lf(mixed), "a\nb\nc");
        assert_eq!(to_crlf(mixed), "a\r\nb\r\nc");
        assert_eq!(to_crlf(&to_crlf(mixed)), "a\r\nb\r\nc");
    }
}
