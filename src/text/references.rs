//! APA-style reference list formatting.

use crate::state::Source;

/// `Smith, J. A.` from `Jane Alice Smith`.
fn apa_author(name: &str) -> String {
    let parts: Vec<&str> = name.split_whitespace().collect();
    match parts.split_last() {
        Some((last, given)) if !given.is_empty() => {
            let initials: Vec<String> = given
                .iter()
                .filter_map(|p| p.chars().next())
                .map(|c| format!("{}.", c))
                .collect();
            format!("{}, {}", last, initials.join(" "))
        }
        Some((last, _)) => last.to_string(),
        None => "Anonymous".to_string(),
    }
}

fn apa_authors(authors: &[String]) -> String {
    let formatted: Vec<String> = authors.iter().map(|a| apa_author(a)).collect();
    match formatted.as_slice() {
        [] => "Anonymous".to_string(),
        [one] => one.clone(),
        [init @ .., last] => format!("{}, & {}", init.join(", "), last),
    }
}

/// One reference entry.
pub fn format_entry(source: &Source) -> String {
    let year = source
        .year
        .map(|y| y.to_string())
        .unwrap_or_else(|| "n.d.".to_string());
    let title = source.title.trim().trim_end_matches('.');
    let mut entry = format!("{} ({}). {}.", apa_authors(&source.authors), year, title);
    if let Some(url) = source.url.as_deref().filter(|u| !u.is_empty()) {
        entry.push_str(" Retrieved from ");
        entry.push_str(url);
    }
    entry
}

/// The full "References" section, sorted by lead author then year.
/// Empty when there are no sources.
pub fn reference_list(sources: &[Source]) -> String {
    if sources.is_empty() {
        return String::new();
    }
    let mut sorted: Vec<&Source> = sources.iter().collect();
    sorted.sort_by(|a, b| {
        a.lead_author_surname()
            .to_lowercase()
            .cmp(&b.lead_author_surname().to_lowercase())
            .then(a.year.cmp(&b.year))
    });

    let mut lines = vec!["References".to_string(), String::new()];
    lines.extend(sorted.into_iter().map(format_entry));
    lines.join("\n")
}
