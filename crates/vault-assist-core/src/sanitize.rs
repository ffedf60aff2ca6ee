//! Markup cleanup applied to chunk text before it enters a prompt.
//!
//! Image embeds carry no information for a language model and raw link
//! targets are mostly noise, so both are reduced before prompt assembly:
//!
//! | Markup | Result |
//! |--------|--------|
//! | `![[diagram.png]]` | removed |
//! | `![alt](img.png)` | removed |
//! | `<img src="...">` | removed |
//! | `[text](https://...)` | `text` |
//! | `[[Target\|Alias]]` | `Alias` |
//! | `[[Target]]` | `Target` |

use once_cell::sync::Lazy;
use regex::Regex;

static WIKI_EMBED: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[\[[^\]]*\]\]").unwrap());
static MD_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static HTML_IMG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<img\b[^>]*>").unwrap());
static MD_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static WIKI_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([^\]|]*)(?:\|([^\]]*))?\]\]").unwrap());
static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*(?:\n[ \t]*)+\n").unwrap());

/// Strip image embeds and collapse links to their visible text.
///
/// Returns the trimmed result; an empty string means the chunk was pure
/// markup and should be left out of the prompt.
pub fn sanitize_chunk_text(text: &str) -> String {
    let text = WIKI_EMBED.replace_all(text, "");
    let text = MD_IMAGE.replace_all(&text, "");
    let text = HTML_IMG.replace_all(&text, "");
    let text = MD_LINK.replace_all(&text, "$1");
    let text = WIKI_LINK.replace_all(&text, |caps: &regex::Captures| {
        caps.get(2)
            .or_else(|| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    });
    let text = BLANK_RUNS.replace_all(&text, "\n\n");
    text.trim().to_string()
}
