//! Turns the model's free-text analysis reply into a structured
//! [`AiSummary`].
//!
//! The reply is expected to contain six labeled sections; the scanner walks
//! it line by line, switching the active section whenever a header label is
//! seen. Nothing is captured before the first recognized header.

use crate::models::AiSummary;

/// Secondary-language text used when a non-empty reply yields no sections.
pub const PARSE_FAILURE_NOTE: &str = "Parsing failed. Check English summary.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    English,
    RomanUrdu,
    KeyFindings,
    AbnormalValues,
    Recommendations,
    DoctorQuestions,
}

/// Scan the reply and collect the six sections.
///
/// Free-text sections (`English Summary`, `Roman Urdu Summary`) accumulate
/// their lines space-joined. List sections only accept lines that start with
/// a bullet or numbering marker; anything else under them is dropped. When
/// a header label repeats, the later occurrence wins the pointer. This
/// function is total: any input produces a summary, possibly empty.
pub fn parse_analysis_text(text: &str) -> AiSummary {
    let mut summary = AiSummary::default();
    let mut current: Option<Section> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        let lower = line.to_lowercase();

        // Header labels switch the active section. These run before the
        // bold-marker check below: headers usually arrive as
        // "1. **English Summary**: ..." lines.
        if lower.contains("english summary") {
            current = Some(Section::English);
        } else if lower.contains("roman urdu summary") {
            current = Some(Section::RomanUrdu);
        } else if lower.contains("key findings") {
            current = Some(Section::KeyFindings);
        } else if lower.contains("abnormal values") {
            current = Some(Section::AbnormalValues);
        } else if lower.contains("recommendations") {
            current = Some(Section::Recommendations);
        } else if lower.contains("questions for doctor") {
            current = Some(Section::DoctorQuestions);
        } else if !line.is_empty() && !line.starts_with("**") {
            match current {
                Some(Section::English) => append_sentence(&mut summary.english, line),
                Some(Section::RomanUrdu) => append_sentence(&mut summary.roman_urdu, line),
                Some(Section::KeyFindings) => push_list_item(&mut summary.key_findings, line),
                Some(Section::AbnormalValues) => {
                    push_list_item(&mut summary.abnormal_values, line)
                }
                Some(Section::Recommendations) => {
                    push_list_item(&mut summary.recommendations, line)
                }
                Some(Section::DoctorQuestions) => {
                    push_list_item(&mut summary.doctor_questions, line)
                }
                // No header seen yet: preamble text is not captured.
                None => {}
            }
        }
    }

    summary
}

/// [`parse_analysis_text`] with the fail-soft contract on top: a non-empty
/// reply from which nothing could be captured comes back with the raw text
/// as the English summary and a fixed note in the secondary field, so the
/// caller always has something to show.
pub fn parse_or_raw(text: &str) -> AiSummary {
    let summary = parse_analysis_text(text);
    if summary.is_empty() && !text.trim().is_empty() {
        return AiSummary {
            english: text.to_string(),
            roman_urdu: PARSE_FAILURE_NOTE.to_string(),
            ..AiSummary::default()
        };
    }
    summary
}

fn append_sentence(target: &mut String, line: &str) {
    if !target.is_empty() {
        target.push(' ');
    }
    target.push_str(line);
}

/// List sections only take lines led by a bullet or numbering marker; the
/// marker run is stripped before the item is stored.
fn push_list_item(target: &mut Vec<String>, line: &str) {
    let starts_with_marker = line
        .chars()
        .next()
        .is_some_and(|c| c == '-' || c == '•' || c.is_ascii_digit());
    if !starts_with_marker {
        return;
    }

    let item = line
        .trim_start_matches(|c: char| {
            c == '-' || c == '•' || c == '.' || c.is_ascii_digit() || c.is_whitespace()
        })
        .trim();
    if !item.is_empty() {
        target.push(item.to_string());
    }
}
