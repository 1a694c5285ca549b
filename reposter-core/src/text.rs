//! Clean-up of source post text before it is published.
//!
//! VK marks up mentions and links as `[target|label]`. Destinations do not
//! understand that, so it is rewritten into markdown links `[label](target)`,
//! and bare `http(s)://` URLs are shortened to `host/path`.

use std::sync::OnceLock;

use regex::{Captures, Regex};

fn pattern(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("text pattern is a valid regex"))
}

fn bracket_link() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"\[([^\]|]+)\|([^\]]+)\]")
}

fn protocol_url() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"https?://[^\s\]]+")
}

fn vk_object() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"^(club|id)\d+$")
}

fn domain_like() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"^[\w.-]+\.[a-z]{2,}")
}

fn is_http(text: &str) -> bool {
    text.starts_with("http://") || text.starts_with("https://")
}

/// Renders `http(s)://host/path?query` as `host/path`. `None` when there is no host.
pub fn display_url(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    let (host, path) = match rest.find('/') {
        Some(slash) => (&rest[..slash], &rest[slash..]),
        None => (rest, ""),
    };
    if host.is_empty() {
        return None;
    }
    Some(if path == "/" {
        host.to_string()
    } else {
        format!("{host}{path}")
    })
}

fn rewrite_bracket(caps: &Captures<'_>) -> String {
    let target = caps[1].trim();
    let label = caps[2].trim();
    if vk_object().is_match(target) {
        return format!("[{label}](vk.com/{target})");
    }
    // A label that is itself a URL says more than any markup around it.
    if is_http(label) {
        if let Some(shown) = display_url(label) {
            return shown;
        }
    }
    if is_http(target) {
        return match display_url(target) {
            Some(link) => format!("[{label}]({link})"),
            None => label.to_string(),
        };
    }
    if domain_like().is_match(target) {
        return format!("[{label}]({target})");
    }
    label.to_string()
}

/// Rewrites VK link markup into markdown links and shortens bare URLs.
pub fn normalize_links(text: &str) -> String {
    let linked = bracket_link().replace_all(text, rewrite_bracket);
    protocol_url()
        .replace_all(&linked, |caps: &Captures<'_>| {
            display_url(&caps[0]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Tags from a trailing line made only of `#hashtags`, with `_` read as a space.
pub fn extract_tags(text: &str) -> Vec<String> {
    let Some(last_line) = text.trim().lines().last() else {
        return Vec::new();
    };
    let words: Vec<&str> = last_line.split_whitespace().collect();
    if words.is_empty() || !words.iter().all(|word| word.starts_with('#')) {
        return Vec::new();
    }
    words
        .into_iter()
        .map(|word| word.trim_start_matches('#').replace('_', " "))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_mentions_become_markdown_links() {
        assert_eq!(
            normalize_links("Thanks to [club123|Our Club] and [id42|Ann]!"),
            "Thanks to [Our Club](vk.com/club123) and [Ann](vk.com/id42)!"
        );
    }

    #[test]
    fn bracketed_urls_are_shortened() {
        assert_eq!(
            normalize_links("[https://example.org/page?utm=1|read more]"),
            "[read more](example.org/page)"
        );
        assert_eq!(
            normalize_links("[vk.com/away|https://example.org/]"),
            "example.org"
        );
        assert_eq!(normalize_links("[shop.example.com|Shop]"), "[Shop](shop.example.com)");
        assert_eq!(normalize_links("[something odd|Label]"), "Label");
    }

    #[test]
    fn bare_urls_lose_their_scheme_and_query() {
        assert_eq!(
            normalize_links("See https://example.org/a/b?x=1 now"),
            "See example.org/a/b now"
        );
        assert_eq!(normalize_links("plain text"), "plain text");
    }

    #[test]
    fn tags_come_only_from_a_trailing_hashtag_line() {
        assert_eq!(
            extract_tags("Post body\n#music #new_album"),
            vec!["music".to_string(), "new album".to_string()]
        );
        assert!(extract_tags("Post body\n#music and words").is_empty());
        assert!(extract_tags("").is_empty());
    }
}
