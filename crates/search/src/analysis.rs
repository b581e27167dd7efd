//! Text analysis: tokenizing and n-gram expansion.

pub const EDGE_MIN: usize = 1;
pub const EDGE_MAX: usize = 10;
pub const NGRAM_MIN: usize = 3;
pub const NGRAM_MAX: usize = 5;

/// Lowercase words split on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Front-anchored prefixes of each word, `EDGE_MIN..=EDGE_MAX` chars long.
pub fn edge_ngrams(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for w in tokenize(text) {
        let chars: Vec<char> = w.chars().collect();
        for n in EDGE_MIN..=EDGE_MAX.min(chars.len()) {
            out.push(chars[..n].iter().collect());
        }
    }
    dedup(out)
}

/// Every `NGRAM_MIN..=NGRAM_MAX` window of each word. Shorter words yield nothing.
pub fn ngrams(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for w in tokenize(text) {
        let chars: Vec<char> = w.chars().collect();
        for n in NGRAM_MIN..=NGRAM_MAX {
            if n > chars.len() {
                break;
            }
            for win in chars.windows(n) {
                out.push(win.iter().collect());
            }
        }
    }
    dedup(out)
}

/// The edge gram a query word is looked up by.
pub fn edge_prefix(word: &str) -> String {
    word.to_lowercase().chars().take(EDGE_MAX).collect()
}

fn dedup(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v.dedup();
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_lowercase_words() {
        assert_eq!(tokenize("AAA (dash)"), vec!["aaa", "dash"]);
        assert!(tokenize(" -- ").is_empty());
    }

    #[test]
    fn edge_grams_stop_at_ten() {
        let g = edge_ngrams("Observability");
        assert!(g.contains(&"o".to_string()));
        assert!(g.contains(&"observabil".to_string()));
        assert!(!g.contains(&"observabili".to_string()));
        assert_eq!(edge_prefix("Observability"), "observabil");
    }

    #[test]
    fn ngrams_skip_short_words() {
        assert!(ngrams("ab").is_empty());
        let mut want = vec!["das", "ash", "dash"];
        want.sort();
        assert_eq!(ngrams("dash"), want);
    }
}
