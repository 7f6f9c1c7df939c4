//! Profanity screening of transcribed lyrics.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Code point ranges treated as emoji and removed before analysis.
const EMOJI_RANGES: &[(u32, u32)] = &[
    (0x1F600, 0x1F64F),
    (0x1F300, 0x1F5FF),
    (0x1F680, 0x1F6FF),
    (0x1F1E0, 0x1F1FF),
    (0x2702, 0x27B0),
    (0x24C2, 0x1F251),
    (0x1F926, 0x1F937),
    (0x10000, 0x10FFFF),
    (0x2640, 0x2642),
    (0x2600, 0x2B55),
    (0x200D, 0x200D),
    (0x23CF, 0x23CF),
    (0x23E9, 0x23E9),
    (0x231A, 0x231A),
    (0xFE0F, 0xFE0F),
    (0x3030, 0x3030),
];

/// Most hits a song may carry and still be considered for airplay.
pub const MILD_LIMIT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfanityVerdict {
    /// No hits; the lyrics still go to the sentiment model.
    Clean,
    /// A few English hits.
    Mild,
    Excessive,
}

impl ProfanityVerdict {
    pub fn is_acceptable(self) -> bool {
        matches!(self, ProfanityVerdict::Clean | ProfanityVerdict::Mild)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub text_clean: String,
    pub polish_hits: usize,
    pub english_hits: usize,
    pub verdict: ProfanityVerdict,
}

impl Analysis {
    pub fn is_acceptable(&self) -> bool {
        self.verdict.is_acceptable()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TextAnalyzer {
    polish: Vec<String>,
    english: Vec<String>,
}

impl TextAnalyzer {
    pub fn new(polish: Vec<String>, english: Vec<String>) -> Self {
        Self {
            polish: normalize(polish),
            english: normalize(english),
        }
    }

    /// Load both word lists, one phrase per line.
    pub fn from_files(polish: &Path, english: &Path) -> Result<Self> {
        let read = |path: &Path| -> Result<Vec<String>> {
            let text = fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("cannot read word list {}: {}", path.display(), e))
            })?;
            Ok(text.lines().map(str::to_string).collect())
        };
        let analyzer = Self::new(read(polish)?, read(english)?);
        info!(
            polish = analyzer.polish.len(),
            english = analyzer.english.len(),
            "Loaded profanity lists"
        );
        Ok(analyzer)
    }

    pub fn analyze(&self, text: &str) -> Analysis {
        let text_clean = strip_emoji(text);
        let lower = text_clean.to_lowercase();
        let polish_hits = count_all(&lower, &self.polish);
        let english_hits = count_all(&lower, &self.english);
        let total = polish_hits + english_hits;
        let verdict = if total == 0 {
            ProfanityVerdict::Clean
        } else if total <= MILD_LIMIT && polish_hits == 0 {
            ProfanityVerdict::Mild
        } else {
            ProfanityVerdict::Excessive
        };
        debug!(polish_hits, english_hits, ?verdict, "Analyzed lyrics");
        Analysis {
            text_clean,
            polish_hits,
            english_hits,
            verdict,
        }
    }
}

fn normalize(words: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = words
        .into_iter()
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn is_emoji(c: char) -> bool {
    let cp = c as u32;
    EMOJI_RANGES.iter().any(|&(lo, hi)| (lo..=hi).contains(&cp))
}

pub fn strip_emoji(text: &str) -> String {
    text.chars().filter(|&c| !is_emoji(c)).collect()
}

fn count_all(text: &str, words: &[String]) -> usize {
    words.iter().map(|w| count_whole(text, w)).sum()
}

/// Occurrences of `word` not touching an alphanumeric on either side.
fn count_whole(text: &str, word: &str) -> usize {
    text.match_indices(word)
        .filter(|&(start, matched)| {
            let before = text[..start].chars().next_back();
            let after = text[start + matched.len()..].chars().next();
            !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
        })
        .count()
}
