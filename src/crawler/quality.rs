/// Heuristic quality score for converted Markdown, 0–100.
///
/// Pages below the job's quality threshold are still persisted but left out
/// of the final assembly.
const DOC_KEYWORDS: &[&str] = &[
    "API",
    "documentation",
    "guide",
    "tutorial",
    "reference",
    "manual",
];

const DOC_PATH_SEGMENTS: &[&str] = &[
    "/docs/",
    "/documentation/",
    "/guide/",
    "/tutorial/",
    "/api/",
    "/reference/",
];

pub fn score(content: &str, url_path: &str) -> u32 {
    let mut score: u32 = 0;

    if content.contains("# ") || content.contains("## ") {
        score += 15;
    }

    let fence_count = content.matches("```").count() / 2;
    if fence_count > 0 {
        score += 15;
    }
    score += (fence_count as u32 * 5).min(20);

    if content.len() > 1000 {
        score += 10;
    }
    if content.len() > 5000 {
        score += 15;
    }

    let lower = content.to_lowercase();
    let keyword_hits: usize = DOC_KEYWORDS
        .iter()
        .map(|kw| lower.matches(&kw.to_lowercase()).count())
        .sum();
    score += (keyword_hits as u32 * 5).min(25);

    // Trailing slash so `/api/` matches a path ending in `/api`
    let path = {
        let p = url_path.to_lowercase();
        if p.ends_with('/') {
            p
        } else {
            format!("{p}/")
        }
    };
    if DOC_PATH_SEGMENTS.iter().any(|seg| path.contains(seg)) {
        score += 15;
    }

    score.min(100)
}

/// Whitespace-delimited token count.
pub fn word_count(content: &str) -> u32 {
    content.split_whitespace().count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_content_scores_zero() {
        assert_eq!(score("", "/blog/post"), 0);
    }

    #[test]
    fn test_headings_and_fences() {
        let md = "## Install\n\n```sh\ncargo add docspasta\n```\n";
        // 15 headings + 15 fence presence + 5 for one fence
        assert_eq!(score(md, "/blog"), 35);
    }

    #[test]
    fn test_fence_bonus_caps_at_twenty() {
        let md = "```\na\n```\n".repeat(10);
        // 15 presence + capped 20 per-fence
        assert_eq!(score(&md, "/x"), 35);
    }

    #[test]
    fn test_keyword_bonus_caps_at_twenty_five() {
        let md = "API api API guide tutorial reference manual documentation";
        let s = score(md, "/x");
        // No headings/fences/length: keywords only, capped
        assert_eq!(s, 25);
    }

    #[test]
    fn test_length_bonuses() {
        let filler = "x".repeat(1500);
        assert_eq!(score(&filler, "/x"), 10);
        let long = "x".repeat(6000);
        assert_eq!(score(&long, "/x"), 25);
    }

    #[test]
    fn test_doc_path_bonus() {
        assert_eq!(score("", "/docs/intro"), 15);
        assert_eq!(score("", "/api"), 15);
        assert_eq!(score("", "/about"), 0);
    }

    #[test]
    fn test_clamped_at_hundred() {
        let rich = format!(
            "# API guide\n\n{}\n\n{}",
            "```rs\ncode\n```\n".repeat(6),
            "API documentation guide tutorial reference manual ".repeat(20)
        );
        let long = format!("{rich}{}", "body text ".repeat(1000));
        assert_eq!(score(&long, "/docs/api/reference"), 100);
    }

    #[test]
    fn test_word_count() {
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("one  two\nthree\tfour"), 4);
    }
}
