//! Placeholder scanning and substitution.
//!
//! A placeholder is the configured marker, optionally followed by `#intent` where
//! the intent is a run of `[A-Za-z0-9._-]`. Bytes around a placeholder are never
//! touched.

use std::collections::HashMap;

/// Whether repeated identical placeholders in one response share a token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TokenReuse {
    #[default]
    Shared,
    PerOccurrence,
}

impl TokenReuse {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenReuse::Shared => "shared",
            TokenReuse::PerOccurrence => "per_occurrence",
        }
    }
}

/// Substitution state for one response: body and headers share issued tokens.
pub struct Substitution<'m> {
    marker: &'m [u8],
    reuse: TokenReuse,
    issued: HashMap<Vec<u8>, String>,
    minted: usize,
}

impl<'m> Substitution<'m> {
    pub fn new(marker: &'m str, reuse: TokenReuse) -> Self {
        Self {
            marker: marker.as_bytes(),
            reuse,
            issued: HashMap::new(),
            minted: 0,
        }
    }

    /// Number of tokens minted so far.
    pub fn minted(&self) -> usize {
        self.minted
    }

    /// Replace every placeholder in `input`, or `None` when there is none.
    ///
    /// `mint` receives the placeholder intent and returns a token.
    pub fn apply<F>(&mut self, input: &[u8], mint: &mut F) -> Option<Vec<u8>>
    where
        F: FnMut(Option<&str>) -> String,
    {
        if self.marker.is_empty() {
            return None;
        }

        let mut output: Option<Vec<u8>> = None;
        let mut copied = 0;
        let mut cursor = 0;

        while let Some(start) = find(input, self.marker, cursor) {
            let after_marker = start + self.marker.len();
            let end = intent_end(input, after_marker);
            let intent = (end > after_marker)
                .then(|| std::str::from_utf8(&input[after_marker + 1..end]).ok())
                .flatten();
            let literal = &input[start..end];

            let token = self.token_for(literal, intent, mint);
            let buffer = output.get_or_insert_with(|| Vec::with_capacity(input.len()));
            buffer.extend_from_slice(&input[copied..start]);
            buffer.extend_from_slice(token.as_bytes());

            copied = end;
            cursor = end;
        }

        output.map(|mut buffer| {
            buffer.extend_from_slice(&input[copied..]);
            buffer
        })
    }

    fn token_for<F>(&mut self, literal: &[u8], intent: Option<&str>, mint: &mut F) -> String
    where
        F: FnMut(Option<&str>) -> String,
    {
        if self.reuse == TokenReuse::Shared
            && let Some(token) = self.issued.get(literal)
        {
            return token.clone();
        }

        let token = mint(intent);
        self.minted += 1;
        if self.reuse == TokenReuse::Shared {
            self.issued.insert(literal.to_vec(), token.clone());
        }
        token
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || haystack.len() - from < needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|position| position + from)
}

/// End of the placeholder starting right after its marker. A `#` without a
/// following intent character is not part of the placeholder.
fn intent_end(input: &[u8], after_marker: usize) -> usize {
    if input.get(after_marker) != Some(&b'#') {
        return after_marker;
    }
    let intent_len = input[after_marker + 1..]
        .iter()
        .take_while(|&&byte| is_intent_byte(byte))
        .count();
    if intent_len == 0 {
        after_marker
    } else {
        after_marker + 1 + intent_len
    }
}

fn is_intent_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_mint() -> impl FnMut(Option<&str>) -> String {
        let mut next = 0;
        move |intent: Option<&str>| {
            next += 1;
            format!("[{}:{next}]", intent.unwrap_or("-"))
        }
    }

    fn apply(input: &str, reuse: TokenReuse) -> Option<String> {
        let mut substitution = Substitution::new("__CSRF__", reuse);
        let mut mint = counter_mint();
        substitution
            .apply(input.as_bytes(), &mut mint)
            .map(|bytes| String::from_utf8(bytes).expect("utf8"))
    }

    #[test]
    fn input_without_placeholder_is_untouched() {
        assert_eq!(apply("<p>nothing here</p>", TokenReuse::Shared), None);
        assert_eq!(apply("", TokenReuse::Shared), None);
        assert_eq!(apply("__CSRF", TokenReuse::Shared), None);
    }

    #[test]
    fn surrounding_bytes_are_preserved() {
        assert_eq!(
            apply("<input value=\"__CSRF__\">", TokenReuse::Shared).as_deref(),
            Some("<input value=\"[-:1]\">")
        );
        assert_eq!(apply("__CSRF__", TokenReuse::Shared).as_deref(), Some("[-:1]"));
    }

    #[test]
    fn intents_are_distinct_placeholders() {
        assert_eq!(
            apply("__CSRF__#checkout __CSRF__#login __CSRF__#checkout", TokenReuse::Shared)
                .as_deref(),
            Some("[checkout:1] [login:2] [checkout:1]")
        );
    }

    #[test]
    fn per_occurrence_mints_every_time() {
        assert_eq!(
            apply("__CSRF__ __CSRF__", TokenReuse::PerOccurrence).as_deref(),
            Some("[-:1] [-:2]")
        );
    }

    #[test]
    fn bare_hash_is_not_an_intent() {
        assert_eq!(
            apply("__CSRF__#\"", TokenReuse::Shared).as_deref(),
            Some("[-:1]#\"")
        );
    }

    #[test]
    fn adjacent_markers() {
        assert_eq!(
            apply("__CSRF____CSRF__", TokenReuse::PerOccurrence).as_deref(),
            Some("[-:1][-:2]")
        );
    }

    #[test]
    fn substitution_tracks_minted_tokens_across_inputs() {
        let mut substitution = Substitution::new("__CSRF__", TokenReuse::Shared);
        let mut mint = counter_mint();

        let header = substitution.apply(b"__CSRF__", &mut mint).expect("header");
        let body = substitution.apply(b"x __CSRF__ y", &mut mint).expect("body");

        assert_eq!(header, b"[-:1]");
        assert_eq!(body, b"x [-:1] y");
        assert_eq!(substitution.minted(), 1);
    }

    #[test]
    fn empty_marker_never_matches() {
        let mut substitution = Substitution::new("", TokenReuse::Shared);
        let mut mint = counter_mint();
        assert_eq!(substitution.apply(b"abc", &mut mint), None);
    }
}
