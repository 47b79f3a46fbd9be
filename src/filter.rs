//! Profanity masking applied to every message before it is stored or delivered.
//!
//! Matching is a case-insensitive substring search; each matched character is
//! replaced by `*`, so the masked text keeps its original length.

/// Built-in word list. Chosen so no entry is a substring of common words.
pub const DEFAULT_PROFANITY_WORDS: &[&str] = &[
    "fuck", "shit", "bitch", "bastard", "asshole", "dickhead", "cunt", "wanker",
];

#[derive(Debug, Clone, Default)]
pub struct ProfanityFilter {
    words: Vec<Vec<char>>,
}

impl ProfanityFilter {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let words = words
            .into_iter()
            .map(|w| w.as_ref().trim().chars().map(fold).collect::<Vec<char>>())
            .filter(|w| !w.is_empty())
            .collect();
        Self { words }
    }

    /// Return `text` with every listed word masked by a run of `*`.
    pub fn clean(&self, text: &str) -> String {
        if self.words.is_empty() {
            return text.to_string();
        }
        let chars: Vec<char> = text.chars().collect();
        let folded: Vec<char> = chars.iter().copied().map(fold).collect();
        let mut mask = vec![false; chars.len()];

        for word in &self.words {
            let n = word.len();
            if n > folded.len() {
                continue;
            }
            for start in 0..=folded.len() - n {
                if folded[start..start + n] == word[..] {
                    mask[start..start + n].iter_mut().for_each(|m| *m = true);
                }
            }
        }

        chars
            .into_iter()
            .zip(mask)
            .map(|(c, masked)| if masked { '*' } else { c })
            .collect()
    }

    pub fn is_clean(&self, text: &str) -> bool {
        self.clean(text) == text
    }
}

fn fold(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}
