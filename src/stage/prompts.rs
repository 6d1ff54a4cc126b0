//! Instruction text handed to the text generator.
//!
//! Kept deliberately plain: the engine only depends on the shape of what comes
//! back, which each stage validates.

use crate::state::{LengthWindow, QualityIssue, QualityRule, Requirements, Source};

/// How freely a rework may rephrase the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Voice {
    Free,
    /// The text was humanized; rephrasing would undo that work.
    Preserve,
}

impl Voice {
    fn note(self) -> &'static str {
        match self {
            Self::Free => "",
            Self::Preserve => {
                "\nThe text has already been edited for a natural human voice. Keep its word \
                 choice, sentence rhythm and tone; touch only the sentences the task requires."
            }
        }
    }
}

pub fn analyze_requirements(description: &str, attachments: &str) -> String {
    format!(
        "Read the order below and extract its requirements.\n\n\
         ORDER DESCRIPTION:\n{description}\n\n\
         ATTACHED FILES:\n{attachments}\n\n\
         Return ONLY a JSON object with these keys:\n\
         - \"is_sufficient\": boolean, false when the topic or task cannot be determined\n\
         - \"missing_info\": string, what is missing when is_sufficient is false\n\
         - \"pages_detected\": integer\n\
         - \"assignment_type\": string (essay, report, reflection, ...)\n\
         - \"main_topic\": string\n\
         - \"main_question\": string\n\
         - \"citation_style\": one of \"APA\", \"MLA\", \"Harvard\", \"Chicago\"\n\
         - \"required_sources\": integer\n\
         - \"search_keywords\": array of short search phrases"
    )
}

pub fn write_draft(req: &Requirements) -> String {
    format!(
        "Write a {kind} of about {words} words.\n\n\
         TOPIC: {topic}\nMAIN QUESTION: {question}\n\n\
         Structure: an introduction ending in a thesis, body paragraphs that each open with a \
         topic sentence and close with a concluding sentence, and a conclusion.\n\
         Separate paragraphs with a blank line. Do not include citations or a reference list.\n\
         Return only the text.",
        kind = req.assignment_type,
        words = req.target_words,
        topic = req.topic,
        question = req.main_question,
    )
}

pub fn integrate_citations(draft: &str, sources: &[Source]) -> String {
    let listing: Vec<String> = sources
        .iter()
        .map(|s| {
            format!(
                "- {} {}: {}",
                s.in_text_citation(),
                s.title,
                s.abstract_text.as_deref().unwrap_or("(no abstract)")
            )
        })
        .collect();
    format!(
        "Insert in-text citations into the text below using the sources listed.\n\
         Cite each source at least once, exactly in the form shown, e.g. (Smith, 2021).\n\
         Place citations only in the middle of body paragraphs, never in the first or last \
         sentence of a paragraph, and never in the introduction or conclusion.\n\
         Keep all other wording. Return only the full text.\n\n\
         SOURCES:\n{}\n\nTEXT:\n{}",
        listing.join("\n"),
        draft
    )
}

pub fn expand(draft: &str, current: u32, window: LengthWindow, voice: Voice) -> String {
    format!(
        "The text below has {current} words; it needs between {low} and {high}.\n\
         Expand it by developing existing arguments with more explanation and examples.\n\
         Keep every citation and the paragraph structure. Return only the full text.{note}\n\nTEXT:\n{draft}",
        low = window.low,
        high = window.high,
        note = voice.note(),
    )
}

pub fn shorten(draft: &str, current: u32, window: LengthWindow, voice: Voice) -> String {
    format!(
        "The text below has {current} words; it needs between {low} and {high}.\n\
         Shorten it by removing repetition and tightening sentences.\n\
         Keep every citation and the paragraph structure. Return only the full text.{note}\n\nTEXT:\n{draft}",
        low = window.low,
        high = window.high,
        note = voice.note(),
    )
}

pub fn revise(
    draft: &str,
    failing: &[QualityRule],
    issues: &[QualityIssue],
    req: &Requirements,
    voice: Voice,
) -> String {
    let rules: Vec<String> = failing
        .iter()
        .map(|r| format!("{}. {}", r.number(), r.guidance()))
        .collect();
    let findings: Vec<String> = issues
        .iter()
        .filter(|i| failing.contains(&i.rule))
        .map(|i| format!("- rule {}: {}", i.rule.number(), i.detail))
        .collect();
    format!(
        "Revise the {kind} below so it satisfies these rules:\n{rules}\n\n\
         Problems found:\n{findings}\n\n\
         Change only what the rules require. Keep the length close to {words} words, keep \
         citations that are already well placed, and keep paragraph breaks.\n\
         Return only the revised text.{note}\n\nTEXT:\n{draft}",
        kind = req.assignment_type,
        rules = rules.join("\n"),
        findings = findings.join("\n"),
        words = req.target_words,
        note = voice.note(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CitationStyle;

    #[test]
    fn revise_lists_only_failing_rules() {
        let req = Requirements {
            topic: "Heat".into(),
            main_question: "Why?".into(),
            assignment_type: "essay".into(),
            target_words: 600,
            citation_style: CitationStyle::Apa,
            keywords: vec![],
            required_sources: 2,
            pages: 2,
        };
        let issues = vec![
            QualityIssue {
                rule: QualityRule::NoContractions,
                detail: "contraction \"don't\"".into(),
            },
            QualityIssue {
                rule: QualityRule::NoAnnouncedThesis,
                detail: "ignored".into(),
            },
        ];
        let text = revise("Draft.", &[QualityRule::NoContractions], &issues, &req, Voice::Free);
        assert!(text.contains("3. Write out every contraction"));
        assert!(text.contains("rule 3: contraction"));
        assert!(!text.contains("ignored"));
        assert!(!text.contains("human voice"));
    }

    #[test]
    fn preserved_voice_is_requested_before_the_text() {
        let window = LengthWindow { low: 950, high: 1050 };
        let text = shorten("Body.", 1200, window, Voice::Preserve);
        assert!(text.starts_with("The text below has 1200 words"));
        let (instructions, body) = text.rsplit_once("TEXT:\n").unwrap();
        assert!(instructions.contains("natural human voice"));
        assert_eq!(body, "Body.");
    }
}
