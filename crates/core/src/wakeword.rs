//! Fuzzy wake-word matching.
//!
//! Speech recognizers rarely spell an unusual name the same way twice, so a
//! recognized phrase counts as the wake word when its edit distance to any
//! trigger phrase is small.

/// Trigger phrases the recognizer has been observed to produce for the wake word.
pub const DEFAULT_TRIGGER_PHRASES: &[&str] = &[
    "hey anthony",
    "hey empyrean",
    "hey imperium",
    "hey empirin",
    "hey emporium",
    "hey period",
    "hey empire in",
    "hey mp erin",
    "hey empyrion",
    "hey in korean",
    "hey in pidgin",
];

/// Largest edit distance still accepted as a match.
pub const DEFAULT_MAX_DISTANCE: usize = 3;

/// Levenshtein distance over Unicode scalar values.
pub fn levenshtein(a: &str, b: &str) -> usize {
    if a == b {
        return 0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (curr[j] + 1).min(prev[j + 1] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// A fixed set of trigger phrases with a distance threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSet {
    phrases: Vec<String>,
    max_distance: usize,
}

impl Default for TriggerSet {
    fn default() -> Self {
        Self::new(DEFAULT_TRIGGER_PHRASES.iter().copied())
    }
}

impl TriggerSet {
    /// Builds a set from phrases; phrases are normalized the same way input is.
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| normalize(p.as_ref()))
                .filter(|p| !p.is_empty())
                .collect(),
            max_distance: DEFAULT_MAX_DISTANCE,
        }
    }

    pub fn with_max_distance(mut self, max_distance: usize) -> Self {
        self.max_distance = max_distance;
        self
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    /// Whether `text` is within the distance threshold of any trigger phrase.
    pub fn matches(&self, text: &str) -> bool {
        let text = normalize(text);
        !text.is_empty()
            && self
                .phrases
                .iter()
                .any(|p| levenshtein(&text, p) <= self.max_distance)
    }

    /// Returns the first recognition alternative that matches.
    pub fn find_match<'a, S: AsRef<str>>(&self, alternatives: &'a [S]) -> Option<&'a str> {
        alternatives
            .iter()
            .map(|alt| alt.as_ref())
            .find(|alt| self.matches(alt))
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}
