//! Artist/title reconstruction from raw uploader and title strings

/// Channel-branding suffixes dropped from uploader names
const BRANDING: [&str; 2] = ["VEVO", " - Topic"];

/// Separators tried in order; only the first one present splits
const SEPARATORS: [char; 3] = ['-', '–', ':'];

/// Reconstruct `(artist, title)` from an uploader name and a video title
///
/// Quote marks are dropped (their content stays), parenthesised and
/// bracketed annotations outside the quoted span are removed, and the
/// remainder is split on the first separator kind present. Without a
/// separator the uploader, minus branding, becomes the artist.
pub fn repair(raw_uploader: &str, raw_title: &str) -> (String, String) {
    let cleaned = strip_annotations(raw_title);

    let parts: Vec<&str> = SEPARATORS
        .iter()
        .map(|sep| cleaned.split(*sep).collect::<Vec<_>>())
        .find(|parts| parts.len() > 1)
        .unwrap_or_else(|| vec![cleaned.as_str()]);

    let (artist, title) = if parts.len() > 1 {
        let title = parts[1..].join("-");
        (
            parts[0].trim().to_string(),
            title.trim().trim_matches(|c| c == ' ' || c == '-').to_string(),
        )
    } else {
        let artist = BRANDING
            .iter()
            .fold(raw_uploader.to_string(), |acc, brand| acc.replace(brand, ""));
        (artist.trim().to_string(), parts[0].trim().to_string())
    };

    (tidy_field(&artist), tidy_field(&title))
}

/// Fold `_`/`-` to spaces, then capitalise every word
fn tidy_field(field: &str) -> String {
    let folded = field.replace(['_', '-'], " ");
    capitalize_words(&folded)
}

/// First letter upper case, the rest lower case, single spaces between words
pub fn capitalize_words(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drop quote marks and `(...)`/`[...]` groups outside the quoted span
fn strip_annotations(title: &str) -> String {
    let chars: Vec<char> = title.chars().collect();
    let quotes: Vec<usize> = chars
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == '"')
        .map(|(i, _)| i)
        .take(2)
        .collect();
    let quoted = match quotes.as_slice() {
        [open, close] => Some((*open, *close)),
        _ => None,
    };
    let inside_quotes = |i: usize| quoted.is_some_and(|(open, close)| i > open && i < close);

    let mut out = String::with_capacity(title.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if c == '"' && quoted.is_some() {
            i += 1;
            continue;
        }

        let closing = match c {
            '(' => Some(')'),
            '[' => Some(']'),
            _ => None,
        };
        if let Some(closing) = closing {
            if !inside_quotes(i) {
                if let Some(end) = chars[i + 1..].iter().position(|&ch| ch == closing) {
                    i += end + 2;
                    continue;
                }
            }
        }

        out.push(c);
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separator_splits_artist_and_title() {
        assert_eq!(
            repair("starsetonline", "STARSET - PERFECT MACHINE (Official Audio)"),
            ("Starset".to_string(), "Perfect Machine".to_string())
        );
    }

    #[test]
    fn test_no_separator_uses_uploader() {
        assert_eq!(
            repair("starsetonline", "PERFECT MACHINE (Official Audio)"),
            ("Starsetonline".to_string(), "Perfect Machine".to_string())
        );
    }

    #[test]
    fn test_branding_suffixes_are_dropped() {
        assert_eq!(
            repair("TaylorSwiftVEVO", "Cardigan"),
            ("Taylorswift".to_string(), "Cardigan".to_string())
        );
        assert_eq!(
            repair("Daft Punk - Topic", "One More Time"),
            ("Daft Punk".to_string(), "One More Time".to_string())
        );
        assert_eq!(
            repair("AdeleVEVO", "Hello [Official Video]"),
            ("Adele".to_string(), "Hello".to_string())
        );
    }

    #[test]
    fn test_en_dash_and_colon_fallbacks() {
        assert_eq!(
            repair("x", "Muse – Uprising"),
            ("Muse".to_string(), "Uprising".to_string())
        );
        assert_eq!(
            repair("x", "Muse: Uprising [HD]"),
            ("Muse".to_string(), "Uprising".to_string())
        );
    }

    #[test]
    fn test_annotations_inside_quotes_survive() {
        assert_eq!(
            repair("ch", "Band - \"Song (Live)\" (Official)"),
            ("Band".to_string(), "Song (live)".to_string())
        );
    }

    #[test]
    fn test_underscores_fold_to_spaces() {
        assert_eq!(
            repair("some_channel", "deep_house mix"),
            ("Some Channel".to_string(), "Deep House Mix".to_string())
        );
    }

    #[test]
    fn test_unmatched_bracket_is_kept() {
        assert_eq!(
            repair("ch", "Artist - Title (unfinished"),
            ("Artist".to_string(), "Title (unfinished".to_string())
        );
    }

    #[test]
    fn test_capitalize_words() {
        assert_eq!(capitalize_words("  hELLO   wORLD "), "Hello World");
        assert_eq!(capitalize_words(""), "");
    }
}
