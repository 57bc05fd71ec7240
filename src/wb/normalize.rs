use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;

static BLOCK_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(?:br|p|li|ul|ol|div|tr|h[1-6])\b[^>]*>").expect("block tag pattern")
});

static SPACE_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t\u{a0}]{2,}").expect("space run pattern"));

/// Plain text from a marketplace description: block and line-break tags become
/// newlines, remaining markup is dropped, entities are decoded and whitespace is
/// collapsed to single spaces inside lines with no blank lines.
pub fn html_to_text(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let cleaned = BLOCK_TAGS.replace_all(html, "\n");
    let fragment = Html::parse_fragment(&cleaned);
    let raw: String = fragment.root_element().text().collect();

    let lines = raw
        .lines()
        .map(|line| SPACE_RUNS.replace_all(line, " ").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    lines.join("\n")
}

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_tags_become_newlines() {
        let text = html_to_text("Паста<br>Масло<br/>Соль<p>Способ применения:</p><ul><li>утром</li><li>вечером</li></ul>");
        assert_eq!(text, "Паста\nМасло\nСоль\nСпособ применения:\nутром\nвечером");
    }

    #[test]
    fn inline_markup_is_stripped_without_splitting_words() {
        let text = html_to_text("<b>Натуральная</b> тайская <span class=\"x\">паста</span>");
        assert_eq!(text, "Натуральная тайская паста");
    }

    #[test]
    fn entities_are_decoded() {
        let text = html_to_text("Tom &amp; Jerry &quot;classic&quot; &lt;3&gt; caf&eacute;");
        assert_eq!(text, "Tom & Jerry \"classic\" <3> café");
    }

    #[test]
    fn whitespace_runs_and_blank_lines_collapse() {
        let text = html_to_text("  first   line \t here&nbsp;&nbsp;now\n\n\n   second  ");
        assert_eq!(text, "first line here now\nsecond");
    }

    #[test]
    fn plain_text_survives_untouched() {
        let text = html_to_text("Препятствует образованию зубного камня");
        assert_eq!(text, "Препятствует образованию зубного камня");
    }

    #[test]
    fn empty_input_yields_empty_text() {
        assert_eq!(html_to_text("   "), "");
    }

    #[test]
    fn char_len_counts_scalars_not_bytes() {
        assert_eq!(char_len("паста"), 5);
    }
}
