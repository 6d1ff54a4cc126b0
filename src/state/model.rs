use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The order as it arrives from intake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBrief {
    pub description: String,
    pub pages: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    /// Explicit word target; overrides pages x words-per-page when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_words: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationStyle {
    Apa,
    Mla,
    Harvard,
    Chicago,
}

impl CitationStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apa => "apa",
            Self::Mla => "mla",
            Self::Harvard => "harvard",
            Self::Chicago => "chicago",
        }
    }
}

impl FromStr for CitationStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apa" => Ok(Self::Apa),
            "mla" => Ok(Self::Mla),
            "harvard" => Ok(Self::Harvard),
            "chicago" => Ok(Self::Chicago),
            _ => Err(format!("Invalid citation style: {}", s)),
        }
    }
}

/// Structured requirements derived from the brief by `analyze_requirements`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    pub topic: String,
    pub main_question: String,
    pub assignment_type: String,
    pub target_words: u32,
    pub citation_style: CitationStyle,
    pub keywords: Vec<String>,
    pub required_sources: usize,
    pub pages: u32,
}

/// A candidate source attached to the draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    pub verified: bool,
}

impl Source {
    /// Family name of the first author, or "Anonymous".
    pub fn lead_author_surname(&self) -> String {
        self.authors
            .first()
            .and_then(|name| name.split_whitespace().last())
            .map(str::to_string)
            .unwrap_or_else(|| "Anonymous".to_string())
    }

    /// In-text citation in `(Author, Year)` form.
    pub fn in_text_citation(&self) -> String {
        let surname = self.lead_author_surname();
        let author = match self.authors.len() {
            0 | 1 => surname,
            2 => {
                let second = self.authors[1]
                    .split_whitespace()
                    .last()
                    .unwrap_or_default()
                    .to_string();
                format!("{} & {}", surname, second)
            }
            _ => format!("{} et al.", surname),
        };
        match self.year {
            Some(year) => format!("({}, {})", author, year),
            None => format!("({}, n.d.)", author),
        }
    }
}

/// The deterministic writing rubric, numbered as reviewers know it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityRule {
    NoAnnouncedThesis,
    NoProhibitedWords,
    NoContractions,
    CitationPlacement,
    NoCitationInConclusion,
    NoInitialConjunctions,
}

impl QualityRule {
    pub const ALL: [QualityRule; 6] = [
        Self::NoAnnouncedThesis,
        Self::NoProhibitedWords,
        Self::NoContractions,
        Self::CitationPlacement,
        Self::NoCitationInConclusion,
        Self::NoInitialConjunctions,
    ];

    pub fn number(&self) -> u8 {
        match self {
            Self::NoAnnouncedThesis => 1,
            Self::NoProhibitedWords => 2,
            Self::NoContractions => 3,
            Self::CitationPlacement => 4,
            Self::NoCitationInConclusion => 5,
            Self::NoInitialConjunctions => 6,
        }
    }

    /// Instruction handed to the reviser when the rule fails.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::NoAnnouncedThesis => {
                "Do not announce the essay's purpose; state the argument directly."
            }
            Self::NoProhibitedWords => "Replace overused filler vocabulary with plain words.",
            Self::NoContractions => "Write out every contraction in full.",
            Self::CitationPlacement => {
                "Keep citations out of the first and last sentence of each body paragraph."
            }
            Self::NoCitationInConclusion => "Remove citations from the conclusion.",
            Self::NoInitialConjunctions => "Do not start sentences with And, But or Or.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub rule: QualityRule,
    pub detail: String,
}

/// Per-rule pass/fail map plus the concrete findings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub rules: BTreeMap<QualityRule, bool>,
    #[serde(default)]
    pub issues: Vec<QualityIssue>,
}

impl QualityReport {
    pub fn all_passed(&self) -> bool {
        !self.rules.is_empty() && self.rules.values().all(|passed| *passed)
    }

    pub fn passed(&self, rule: QualityRule) -> bool {
        self.rules.get(&rule).copied().unwrap_or(false)
    }

    pub fn failing(&self) -> Vec<QualityRule> {
        self.rules
            .iter()
            .filter(|(_, passed)| !**passed)
            .map(|(rule, _)| *rule)
            .collect()
    }

    /// Rules that pass in `self` but fail in `next`.
    pub fn regressions(&self, next: &QualityReport) -> Vec<QualityRule> {
        self.rules
            .iter()
            .filter(|(rule, passed)| **passed && !next.passed(**rule))
            .map(|(rule, _)| *rule)
            .collect()
    }
}

/// Per-run thresholds. Stored in the container so routing reads only state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Fractional tolerance around the word target (0.05 = +/-5%).
    pub length_tolerance: f64,
    /// Highest AI-likelihood percentage accepted without humanizing.
    pub originality_threshold: f64,
    pub words_per_page: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            length_tolerance: 0.05,
            originality_threshold: 5.0,
            words_per_page: 300,
        }
    }
}

/// Inclusive word-count window around a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthWindow {
    pub low: u32,
    pub high: u32,
}

impl LengthWindow {
    pub fn around(target: u32, tolerance: f64) -> Self {
        let target = f64::from(target);
        let tolerance = tolerance.max(0.0);
        Self {
            low: (target * (1.0 - tolerance)).round().max(0.0) as u32,
            high: (target * (1.0 + tolerance)).round() as u32,
        }
    }

    pub fn contains(&self, count: u32) -> bool {
        count >= self.low && count <= self.high
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(authors: &[&str], year: Option<i32>) -> Source {
        Source {
            title: "T".into(),
            authors: authors.iter().map(|a| a.to_string()).collect(),
            year,
            url: None,
            abstract_text: None,
            verified: true,
        }
    }

    #[test]
    fn in_text_citation_forms() {
        assert_eq!(
            source(&["Jane Smith"], Some(2021)).in_text_citation(),
            "(Smith, 2021)"
        );
        assert_eq!(
            source(&["Jane Smith", "Li Wei"], Some(2022)).in_text_citation(),
            "(Smith & Wei, 2022)"
        );
        assert_eq!(
            source(&["A Bell", "B Cole", "C Dunn"], Some(2020)).in_text_citation(),
            "(Bell et al., 2020)"
        );
        assert_eq!(source(&[], None).in_text_citation(), "(Anonymous, n.d.)");
    }

    #[test]
    fn length_window_is_inclusive_and_symmetric() {
        let window = LengthWindow::around(1500, 0.05);
        assert_eq!(window, LengthWindow { low: 1425, high: 1575 });
        assert!(window.contains(1425));
        assert!(window.contains(1575));
        assert!(!window.contains(1424));
        assert!(!window.contains(1576));
    }

    #[test]
    fn quality_report_regressions() {
        let mut before = QualityReport::default();
        before.rules.insert(QualityRule::NoContractions, true);
        before.rules.insert(QualityRule::CitationPlacement, false);

        let mut after = QualityReport::default();
        after.rules.insert(QualityRule::NoContractions, false);
        after.rules.insert(QualityRule::CitationPlacement, true);

        assert_eq!(before.regressions(&after), vec![QualityRule::NoContractions]);
        assert!(after.regressions(&before).contains(&QualityRule::CitationPlacement));
        assert!(!before.all_passed());
        assert!(!QualityReport::default().all_passed());
    }

    #[test]
    fn citation_style_parses_case_insensitively() {
        assert_eq!("APA".parse::<CitationStyle>().unwrap(), CitationStyle::Apa);
        assert!("vancouver".parse::<CitationStyle>().is_err());
    }

    #[test]
    fn rules_are_numbered_one_to_six() {
        let numbers: Vec<u8> = QualityRule::ALL.iter().map(|r| r.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
    }
}
