use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{CrawlError, Result};

/// Containers tried in order for the main content subtree.
const MAIN_SELECTORS: &[&str] = &["main", "article", r#"[role="main"]"#, "body"];

/// Boilerplate stripped from the selected subtree before conversion.
const BOILERPLATE_SELECTORS: &[&str] = &[
    "nav",
    "header",
    "footer",
    "aside",
    "script",
    "style",
    "noscript",
    "iframe",
    ".sidebar",
    ".advertisement",
    ".ads",
    ".menu",
    ".breadcrumb",
    ".pagination",
];

/// Tags serialized without a closing tag.
const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Owned output of the synchronous extraction pass. The DOM never crosses an
/// await point; everything the async pipeline needs is copied out here.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    pub title: Option<String>,
    pub markdown: String,
    pub links: Vec<String>,
    pub word_count: u32,
}

/// Parse a fetched HTML document: title, main content as Markdown, and the
/// absolute form of every harvested link (capped at `max_links`; 0 disables
/// the harvest entirely).
pub fn extract(html: &str, base: &Url, max_links: usize) -> Result<ExtractedPage> {
    let document = Html::parse_document(html);

    let title = extract_title(&document);
    let links = extract_links(&document, base, max_links);

    let main = select_main(&document).ok_or_else(|| {
        CrawlError::Parse(format!("no content container in {base}"))
    })?;

    let skip: Vec<Selector> = BOILERPLATE_SELECTORS
        .iter()
        .map(|s| Selector::parse(s).expect("static selector"))
        .collect();

    let mut filtered = String::new();
    serialize_filtered(main, &skip, &mut filtered);

    let markdown = html2md::parse_html(&filtered).trim().to_string();
    if markdown.is_empty() {
        return Err(CrawlError::Parse(format!("empty content in {base}")));
    }

    let word_count = super::quality::word_count(&markdown);

    Ok(ExtractedPage {
        title,
        markdown,
        links,
        word_count,
    })
}

/// `<title>`, falling back to the first `<h1>`.
fn extract_title(document: &Html) -> Option<String> {
    let title_sel = Selector::parse("title").expect("static selector");
    let text = document
        .select(&title_sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty());
    if text.is_some() {
        return text;
    }

    let h1_sel = Selector::parse("h1").expect("static selector");
    document
        .select(&h1_sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn select_main(document: &Html) -> Option<ElementRef<'_>> {
    for raw in MAIN_SELECTORS {
        let sel = Selector::parse(raw).expect("static selector");
        if let Some(el) = document.select(&sel).next() {
            return Some(el);
        }
    }
    None
}

/// Collect `href` targets resolved against the page URL. Only http(s) links
/// survive; order is preserved and duplicates within the page are dropped.
fn extract_links(document: &Html, base: &Url, max_links: usize) -> Vec<String> {
    if max_links == 0 {
        return Vec::new();
    }
    let sel = Selector::parse("a[href]").expect("static selector");
    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();

    for el in document.select(&sel) {
        if links.len() >= max_links {
            break;
        }
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        let url = resolved.to_string();
        if seen.insert(url.clone()) {
            links.push(url);
        }
    }

    links
}

/// Re-serialize a subtree, skipping elements that match any boilerplate
/// selector. Mirrors a text-collection walk, but keeps markup so the
/// Markdown converter sees headings, lists and code fences intact.
fn serialize_filtered(el: ElementRef<'_>, skip: &[Selector], out: &mut String) {
    let tag = el.value().name();
    let is_void = VOID_TAGS.contains(&tag);

    out.push('<');
    out.push_str(tag);
    for (name, value) in el.value().attrs() {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }
    out.push('>');
    if is_void {
        return;
    }

    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(&escape_text(text));
        } else if let Some(child_el) = ElementRef::wrap(child) {
            if !skip.iter().any(|sel| sel.matches(&child_el)) {
                serialize_filtered(child_el, skip, out);
            }
        }
    }

    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(value: &str) -> String {
    escape_text(value).replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://x.test/docs/intro").unwrap()
    }

    #[test]
    fn test_extracts_main_over_body() {
        let html = r#"<html><head><title>T</title></head><body>
            <nav><a href="/skip">nav</a></nav>
            <main><h1>Guide</h1><p>Body text here.</p></main>
        </body></html>"#;
        let page = extract(html, &base(), 50).unwrap();
        assert_eq!(page.title.as_deref(), Some("T"));
        assert!(page.markdown.contains("Guide"));
        assert!(page.markdown.contains("Body text here."));
        assert!(!page.markdown.contains("nav"));
    }

    #[test]
    fn test_title_falls_back_to_h1() {
        let html = "<html><body><main><h1>Only Heading</h1><p>x</p></main></body></html>";
        let page = extract(html, &base(), 50).unwrap();
        assert_eq!(page.title.as_deref(), Some("Only Heading"));
    }

    #[test]
    fn test_article_and_role_main_fallbacks() {
        let html = "<html><body><article><p>from article</p></article></body></html>";
        let page = extract(html, &base(), 50).unwrap();
        assert!(page.markdown.contains("from article"));

        let html = r#"<html><body><div role="main"><p>from role</p></div><p>outside</p></body></html>"#;
        let page = extract(html, &base(), 50).unwrap();
        assert!(page.markdown.contains("from role"));
        assert!(!page.markdown.contains("outside"));
    }

    #[test]
    fn test_boilerplate_is_stripped() {
        let html = r#"<html><body><main>
            <header>site header</header>
            <div class="sidebar">sidebar junk</div>
            <p>kept paragraph</p>
            <div class="advertisement">buy now</div>
            <footer>footer</footer>
        </main></body></html>"#;
        let page = extract(html, &base(), 50).unwrap();
        assert!(page.markdown.contains("kept paragraph"));
        assert!(!page.markdown.contains("sidebar junk"));
        assert!(!page.markdown.contains("buy now"));
        assert!(!page.markdown.contains("site header"));
        assert!(!page.markdown.contains("footer"));
    }

    #[test]
    fn test_links_resolved_and_capped() {
        let html = r#"<html><body><main><p>x</p>
            <a href="/a">a</a>
            <a href="b">b</a>
            <a href="https://other.test/c">c</a>
            <a href="mailto:x@y.test">mail</a>
            <a href="/a">dup</a>
        </main></body></html>"#;
        let page = extract(html, &base(), 50).unwrap();
        assert_eq!(
            page.links,
            vec![
                "https://x.test/a".to_string(),
                "https://x.test/docs/b".to_string(),
                "https://other.test/c".to_string(),
            ]
        );

        let capped = extract(html, &base(), 2).unwrap();
        assert_eq!(capped.links.len(), 2);

        let disabled = extract(html, &base(), 0).unwrap();
        assert!(disabled.links.is_empty());
    }

    #[test]
    fn test_code_blocks_survive_conversion() {
        let html = r#"<html><body><main>
            <h2>Install</h2>
            <pre><code>cargo build --release</code></pre>
        </main></body></html>"#;
        let page = extract(html, &base(), 0).unwrap();
        assert!(page.markdown.contains("cargo build --release"));
        assert!(page.markdown.contains("Install"));
    }

    #[test]
    fn test_empty_page_is_parse_error() {
        let err = extract("<html><body><main></main></body></html>", &base(), 0).unwrap_err();
        assert_eq!(err.kind(), "parse_error");
    }

    #[test]
    fn test_word_count_counts_markdown_tokens() {
        let html = "<html><body><main><p>one two three four</p></main></body></html>";
        let page = extract(html, &base(), 0).unwrap();
        assert_eq!(page.word_count, 4);
    }
}
