//! The six-rule writing rubric applied by `check_quality`.

use regex::Regex;
use std::sync::LazyLock;

use super::{has_citation, paragraphs, sentences};
use crate::state::{QualityIssue, QualityReport, QualityRule};

static ANNOUNCEMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:this (?:essay|paper|report|assignment) (?:will|aims to|seeks to|examines|discusses|explores)|in this (?:essay|paper|report),? (?:i|we|it) will)\b",
    )
    .unwrap()
});

static CONTRACTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:[a-z]+n['’]t|[a-z]+['’](?:re|ve|ll|d|m)|(?:it|that|there|here|what|who|he|she|let)['’]s)\b",
    )
    .unwrap()
});

pub const PROHIBITED_WORDS: &[&str] = &[
    "delve",
    "realm",
    "harness",
    "unlock",
    "tapestry",
    "paradigm",
    "cutting-edge",
    "revolutionize",
    "landscape",
    "potential",
    "findings",
    "intricate",
    "showcasing",
    "crucial",
    "pivotal",
    "surpass",
    "meticulously",
    "vibrant",
    "unparalleled",
    "underscore",
    "leverage",
    "synergy",
    "innovative",
    "game-changer",
    "testament",
    "commendable",
    "meticulous",
    "highlight",
    "emphasize",
    "boast",
    "groundbreaking",
    "align",
    "foster",
    "fosters",
    "showcase",
    "enhance",
    "holistic",
    "garner",
    "accentuate",
    "pioneering",
    "trailblazing",
    "unleash",
    "versatile",
    "transformative",
    "redefine",
    "seamless",
    "optimize",
    "scalable",
    "robust",
    "breakthrough",
    "empower",
    "streamline",
    "comprehensive",
    "nuanced",
    "multifaceted",
];

const INITIAL_CONJUNCTIONS: &[&str] = &["And", "But", "Or"];

/// Assess a draft against every rule.
pub fn assess(draft: &str) -> QualityReport {
    let mut report = QualityReport::default();
    for rule in QualityRule::ALL {
        let issues = check(rule, draft);
        report.rules.insert(rule, issues.is_empty());
        report.issues.extend(issues.into_iter().map(|detail| QualityIssue { rule, detail }));
    }
    report
}

fn check(rule: QualityRule, draft: &str) -> Vec<String> {
    match rule {
        QualityRule::NoAnnouncedThesis => ANNOUNCEMENT_REGEX
            .find_iter(draft)
            .map(|m| format!("announces intent: \"{}\"", m.as_str()))
            .collect(),
        QualityRule::NoProhibitedWords => prohibited_words(draft)
            .into_iter()
            .map(|w| format!("prohibited word \"{}\"", w))
            .collect(),
        QualityRule::NoContractions => CONTRACTION_REGEX
            .find_iter(draft)
            .map(|m| format!("contraction \"{}\"", m.as_str()))
            .collect(),
        QualityRule::CitationPlacement => citation_placement(draft),
        QualityRule::NoCitationInConclusion => {
            let paras = paragraphs(draft);
            match paras.last() {
                Some(last) if paras.len() >= 2 && has_citation(last) => {
                    vec!["conclusion contains a citation".to_string()]
                }
                _ => Vec::new(),
            }
        }
        QualityRule::NoInitialConjunctions => paragraphs(draft)
            .into_iter()
            .flat_map(sentences)
            .filter(|s| {
                let first = s.split_whitespace().next().unwrap_or_default();
                let first = first.trim_end_matches(|c: char| !c.is_alphanumeric());
                INITIAL_CONJUNCTIONS.contains(&first)
            })
            .map(|s| format!("sentence starts with a conjunction: \"{}\"", s))
            .collect(),
    }
}

fn prohibited_words(draft: &str) -> Vec<String> {
    let mut found: Vec<String> = draft
        .split_whitespace()
        .map(|token| {
            token
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '-')
                .to_lowercase()
        })
        .filter(|token| PROHIBITED_WORDS.contains(&token.as_str()))
        .collect();
    found.sort();
    found.dedup();
    found
}

/// Body paragraphs are everything between the introduction and the conclusion.
pub fn body_paragraphs(draft: &str) -> Vec<&str> {
    let paras = paragraphs(draft);
    if paras.len() < 3 {
        return Vec::new();
    }
    paras[1..paras.len() - 1].to_vec()
}

fn citation_placement(draft: &str) -> Vec<String> {
    let mut issues = Vec::new();
    for (index, para) in body_paragraphs(draft).into_iter().enumerate() {
        let sents = sentences(para);
        if sents.first().is_some_and(|s| has_citation(s)) {
            issues.push(format!("body paragraph {} opens with a citation", index + 1));
        }
        if sents.len() > 1 && sents.last().is_some_and(|s| has_citation(s)) {
            issues.push(format!("body paragraph {} closes with a citation", index + 1));
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAN: &str = "Urban heat islands change how cities plan for summer.\n\n\
        Dense pavement stores heat during the day. Studies measured large gaps at night (Smith, 2021). \
        Planners now treat shade as infrastructure.\n\n\
        Street trees lower surface temperatures. Canopy targets appear in many plans (Bell et al., 2020). \
        Budgets remain the main constraint.\n\n\
        Cities that plant and maintain canopy cool measurably over time.";

    #[test]
    fn clean_draft_passes_every_rule() {
        let report = assess(CLEAN);
        assert!(report.all_passed(), "issues: {:?}", report.issues);
        assert_eq!(report.rules.len(), 6);
    }

    #[test]
    fn announced_thesis_fails_rule_one() {
        let draft = format!("This essay will explain heat.\n\n{}", CLEAN);
        let report = assess(&draft);
        assert!(!report.passed(QualityRule::NoAnnouncedThesis));
        assert!(report.passed(QualityRule::NoContractions));
    }

    #[test]
    fn prohibited_words_are_case_insensitive_whole_words() {
        let draft = "We must Delve into the realm. Aligned goals help.";
        let report = assess(draft);
        assert!(!report.passed(QualityRule::NoProhibitedWords));
        let details: Vec<_> = report.issues.iter().map(|i| i.detail.as_str()).collect();
        assert!(details.contains(&"prohibited word \"delve\""));
        assert!(details.contains(&"prohibited word \"realm\""));
        assert!(!details.iter().any(|d| d.contains("aligned")));
    }

    #[test]
    fn contractions_fail_but_possessives_do_not() {
        assert!(!assess("It doesn't work.").passed(QualityRule::NoContractions));
        assert!(!assess("It's late.").passed(QualityRule::NoContractions));
        assert!(assess("The city's parks are shaded.").passed(QualityRule::NoContractions));
    }

    #[test]
    fn citation_at_paragraph_start_fails_rule_four() {
        let draft = "Intro sentence here.\n\n\
            Trees cool streets (Bell et al., 2020). Shade is cheap. Planners agree.\n\n\
            Conclusion sentence here.";
        let report = assess(draft);
        assert!(!report.passed(QualityRule::CitationPlacement));
        assert!(report.passed(QualityRule::NoCitationInConclusion));
    }

    #[test]
    fn citation_at_paragraph_end_fails_rule_four() {
        let draft = "Intro sentence here.\n\n\
            Trees cool streets. Shade is cheap. Planners agree (Smith, 2021).\n\n\
            Conclusion sentence here.";
        assert!(!assess(draft).passed(QualityRule::CitationPlacement));
    }

    #[test]
    fn citation_in_conclusion_fails_rule_five() {
        let draft = "Intro.\n\nBody one. Middle (Smith, 2021) here. End.\n\nClosing thought (Smith, 2021).";
        assert!(!assess(draft).passed(QualityRule::NoCitationInConclusion));
    }

    #[test]
    fn initial_conjunctions_fail_rule_six() {
        let report = assess("Shade helps. But budgets are tight. Or so planners say.");
        assert!(!report.passed(QualityRule::NoInitialConjunctions));
        assert_eq!(
            report
                .issues
                .iter()
                .filter(|i| i.rule == QualityRule::NoInitialConjunctions)
                .count(),
            2
        );
        assert!(assess("Andrew planted trees.").passed(QualityRule::NoInitialConjunctions));
    }
}
