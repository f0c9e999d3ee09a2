/// Extensions that mark a pasted URL as an image, in match order.
const IMAGE_URL_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "svg", "tiff", "heic", "avif",
];

/// Find image URLs inside free text.
///
/// A URL qualifies when it carries an http(s) scheme and ends in a known
/// image extension, optionally followed by a query string. The scan is
/// case-insensitive and duplicates are returned as found; staging decides
/// what to keep.
pub fn detect_image_urls(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter_map(match_image_url)
        .collect()
}

fn match_image_url(token: &str) -> Option<String> {
    let lower = token.to_ascii_lowercase();
    let start = scheme_start(&lower)?;
    let candidate = &token[start..];
    let lower_candidate = &lower[start..];
    let scheme_len = if lower_candidate.starts_with("https://") {
        8
    } else {
        7
    };

    let bytes = lower_candidate.as_bytes();
    // Prefer the rightmost extension so query strings that themselves end
    // in an image name extend the match.
    for pos in (scheme_len + 1..bytes.len()).rev() {
        if bytes[pos] != b'.' {
            continue;
        }
        let after = &lower_candidate[pos + 1..];
        for ext in IMAGE_URL_EXTENSIONS {
            if !after.starts_with(ext) {
                continue;
            }
            let end = pos + 1 + ext.len();
            if end < bytes.len() && bytes[end] == b'?' {
                return Some(candidate.to_string());
            }
            return Some(candidate[..end].to_string());
        }
    }
    None
}

fn scheme_start(lower: &str) -> Option<usize> {
    match (lower.find("http://"), lower.find("https://")) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
