//! Response content filtering: a keyword denylist applied to text bodies,
//! ported from `ContentFilter.is_content_blocked` in the original proxy.

/// Inspects a response body and decides whether it should be blocked instead
/// of delivered to the client. Invoked only on text-ish content types.
pub trait ContentFilter: Send + Sync {
    /// `Some(reason)` blocks the response; `None` lets it through unchanged.
    fn check(&self, content_type: &str, body: &[u8]) -> Option<String>;
}

/// Case-insensitive substring denylist over the UTF-8 (lossy) body text.
pub struct KeywordContentFilter {
    keywords: Vec<String>,
}

impl KeywordContentFilter {
    pub fn new(keywords: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            keywords: keywords.into_iter().map(|k| k.into().to_lowercase()).collect(),
        }
    }
}

impl ContentFilter for KeywordContentFilter {
    fn check(&self, content_type: &str, body: &[u8]) -> Option<String> {
        if !is_text_like(content_type) {
            return None;
        }
        let text = String::from_utf8_lossy(body).to_lowercase();
        self.keywords
            .iter()
            .find(|kw| text.contains(kw.as_str()))
            .map(|kw| format!("Content blocked: matched keyword \"{kw}\""))
    }
}

fn is_text_like(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ct.starts_with("text/") || ct.contains("json") || ct.contains("xml") || ct.contains("html")
}

/// Passes every response through unchanged; the default when no keywords
/// are configured.
pub struct NoopContentFilter;

impl ContentFilter for NoopContentFilter {
    fn check(&self, _content_type: &str, _body: &[u8]) -> Option<String> {
        None
    }
}
